//! HATEOAS-style response envelopes.

use crate::Error;
use serde_json::{Value, json};

/// `{"data": …, "_links": {"self": {"href": …}}}`
pub fn success(data: Value, href: &str) -> Value {
    json!({
        "data": data,
        "_links": { "self": { "href": href } }
    })
}

/// `{"error": {"message", "status_code", "details"?}, "_links": …}`
pub fn failure(error: &Error, href: &str) -> Value {
    let mut body = json!({
        "message": error.to_string(),
        "status_code": error.status_code(),
    });
    if let Some(details) = error.details() {
        body["details"] = details;
    }
    json!({
        "error": body,
        "_links": { "self": { "href": href } }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_wraps_data_with_self_link() {
        let body = success(json!({"id": 1}), "/api/v1/users/1");
        assert_eq!(body["data"]["id"], json!(1));
        assert_eq!(body["_links"]["self"]["href"], json!("/api/v1/users/1"));
    }

    #[test]
    fn failure_carries_status_and_details() {
        let err = Error::validation("name", "required field is missing");
        let body = failure(&err, "/api/v1/users");
        assert_eq!(body["error"]["status_code"], json!(400));
        assert_eq!(body["error"]["details"][0]["field"], json!("name"));
    }
}
