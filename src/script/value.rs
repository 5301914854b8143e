//! Runtime values of the embedded script evaluator.

use std::fmt;
use std::rc::Rc;

/// Handle into the fetch loop's promise table.
pub type PromiseId = usize;

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(Rc<str>),
    Json(Rc<serde_json::Value>),
    Response(Rc<ResponseValue>),
    Headers(Rc<Vec<(String, String)>>),
    Promise(PromiseId),
}

/// The script-visible view of a completed fetch.
pub struct ResponseValue {
    pub status: u16,
    pub status_text: String,
    pub headers: Rc<Vec<(String, String)>>,
    pub body: Rc<[u8]>,
}

impl ResponseValue {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Convert a parsed JSON node to a script value; objects and arrays
/// stay wrapped so member access can descend into them.
pub fn from_json(node: &serde_json::Value) -> Value {
    match node {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::Str(Rc::from(s.as_str())),
        other => Value::Json(Rc::new(other.clone())),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => write!(f, "{}", format_number(*n)),
            Value::Str(s) => write!(f, "{s}"),
            Value::Json(j) => write!(f, "{j}"),
            Value::Response(r) => write!(f, "[object Response status={}]", r.status),
            Value::Headers(_) => write!(f, "[object Headers]"),
            Value::Promise(_) => write!(f, "[object Promise]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_format_like_scripts_expect() {
        assert_eq!(Value::Num(42.0).to_string(), "42");
        assert_eq!(Value::Num(1.5).to_string(), "1.5");
        assert_eq!(Value::Num(-3.0).to_string(), "-3");
    }

    #[test]
    fn response_ok_range() {
        let r = ResponseValue {
            status: 204,
            status_text: "No Content".to_string(),
            headers: Rc::new(Vec::new()),
            body: Rc::from(&b""[..]),
        };
        assert!(r.ok());
        let r = ResponseValue {
            status: 500,
            status_text: String::new(),
            headers: Rc::new(Vec::new()),
            body: Rc::from(&b""[..]),
        };
        assert!(!r.ok());
    }

    #[test]
    fn json_scalars_unwrap() {
        let v = from_json(&serde_json::json!("x"));
        assert!(matches!(v, Value::Str(_)));
        let v = from_json(&serde_json::json!({"a": 1}));
        assert!(matches!(v, Value::Json(_)));
    }
}
