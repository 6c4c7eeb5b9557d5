//! Submission parsing and validation.
//!
//! Submissions arrive as JSON with loosely typed fields, so validation works
//! on a raw [`serde_json::Value`] rather than a derived struct: a derive
//! would silently coerce or drop fields where the contract requires a
//! rejection (`user_agent: null`, `aggr_limit: "4"`, a negative
//! `aggr_timeout`). Any JSON that fails a rule below is rejected without
//! touching the store.

use serde_json::Value;
use thiserror::Error;
use url::Url;

use super::model::{Aggregation, Job, State};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("aggregation id must be a string")]
    AggrIdNotString,
    #[error("aggregation id cannot be empty")]
    EmptyAggrId,
    #[error("aggregation limit must be a number")]
    LimitNotNumber,
    #[error("aggregation limit must be greater than 0")]
    NonPositiveLimit,
    #[error("aggregation proxy must be a valid absolute URL")]
    InvalidProxy,
    #[error("aggregation timeout must be a number")]
    TimeoutNotNumber,
    #[error("aggregation timeout must be greater than 0")]
    NonPositiveTimeout,
    #[error("url must be an absolute http(s) URL")]
    InvalidUrl,
    #[error("callback_url must be an absolute http(s) URL")]
    InvalidCallbackUrl,
    #[error("extra must be a string")]
    ExtraNotString,
    #[error("user_agent must be a string")]
    UserAgentNotString,
    #[error("submission must be a JSON object")]
    NotAnObject,
}

/// A validated job submission: the job fields plus the aggregation
/// configuration it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub aggregation: Aggregation,
    pub url: String,
    pub callback_url: String,
    pub extra: String,
    pub user_agent: String,
}

impl Submission {
    /// Validate a raw submission document against the contract.
    pub fn parse(value: &Value) -> Result<Self, ValidationError> {
        let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;

        let aggr_id = match obj.get("aggr_id") {
            Some(Value::String(s)) => s.as_str(),
            _ => return Err(ValidationError::AggrIdNotString),
        };
        if aggr_id.is_empty() {
            return Err(ValidationError::EmptyAggrId);
        }

        let url = require_http_url(obj.get("url"), ValidationError::InvalidUrl)?;
        let callback_url =
            require_http_url(obj.get("callback_url"), ValidationError::InvalidCallbackUrl)?;

        let limit = match obj.get("aggr_limit") {
            Some(value) => value
                .as_i64()
                .ok_or(ValidationError::LimitNotNumber)?,
            None => return Err(ValidationError::LimitNotNumber),
        };
        if limit <= 0 {
            return Err(ValidationError::NonPositiveLimit);
        }
        let limit = u32::try_from(limit).map_err(|_| ValidationError::LimitNotNumber)?;

        let proxy = match obj.get("aggr_proxy") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(ValidationError::InvalidProxy),
        };

        let timeout = match obj.get("aggr_timeout") {
            None => None,
            Some(value) => {
                let secs = value
                    .as_i64()
                    .ok_or(ValidationError::TimeoutNotNumber)?;
                if secs <= 0 {
                    return Err(ValidationError::NonPositiveTimeout);
                }
                Some(secs as u64)
            }
        };

        let extra = match obj.get("extra") {
            None => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(ValidationError::ExtraNotString),
        };

        let user_agent = match obj.get("user_agent") {
            None => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(ValidationError::UserAgentNotString),
        };

        let aggregation = Aggregation::new(aggr_id, limit, proxy, timeout)?;

        Ok(Self {
            aggregation,
            url,
            callback_url,
            extra,
            user_agent,
        })
    }

    /// Materialize the job record with the given id.
    pub fn job(&self, id: String) -> Job {
        Job {
            id,
            url: self.url.clone(),
            aggr_id: self.aggregation.id.clone(),
            download_state: State::Pending,
            retry_count: 0,
            meta: String::new(),
            callback_url: self.callback_url.clone(),
            callback_count: 0,
            callback_state: State::Pending,
            extra: self.extra.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

fn require_http_url(
    value: Option<&Value>,
    err: ValidationError,
) -> Result<String, ValidationError> {
    let raw = match value {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => return Err(err),
    };
    let parsed = Url::parse(raw).map_err(|_| err.clone())?;
    match parsed.scheme() {
        "http" | "https" => Ok(raw.clone()),
        _ => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(raw: &str) -> Result<Submission, ValidationError> {
        let value: Value = serde_json::from_str(raw).expect("test input must be JSON");
        Submission::parse(&value)
    }

    #[test]
    fn accepts_valid_submissions() {
        let cases = [
            r#"{"aggr_id":"foo","aggr_limit":4,"url":"http://foobar.com","callback_url":"http://foo.bar","extra":"whatever"}"#,
            r#"{"aggr_id":"foo","aggr_limit":4,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"foo","aggr_limit":4,"url":"http://foobar.com","callback_url":"http://foo.bar","extra":""}"#,
            r#"{"aggr_id":"proxybar","aggr_limit":4,"aggr_proxy":"","url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"proxybaz","aggr_limit":4,"aggr_proxy":null,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"proxyqux","aggr_limit":4,"aggr_proxy":"https://example.org","url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"timeoutfoo","aggr_limit":4,"aggr_timeout":12,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"uafoo","aggr_limit":4,"user_agent":"Downloader Test","url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"uafoo","aggr_limit":4,"user_agent":"","url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
        ];

        for raw in cases {
            assert!(parse(raw).is_ok(), "expected accept: {raw}");
        }
    }

    #[test]
    fn rejects_invalid_submissions() {
        let cases = [
            // not an object / garbage
            r#""just a string""#,
            r#"[1,2,3]"#,
            // aggr_id
            r#"{"aggr_limit":4,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":4,"aggr_limit":4,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":true,"aggr_limit":4,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"","aggr_limit":4,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            // url
            r#"{"aggr_id":"foo","aggr_limit":4,"url":"foo","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"foo","aggr_limit":4,"url":"","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"foo","aggr_limit":4,"callback_url":"http://foo.bar"}"#,
            // callback_url
            r#"{"aggr_id":"foo","aggr_limit":4,"url":"http://foobar.com","callback_url":"fijfij"}"#,
            // aggr_limit
            r#"{"aggr_id":"limitqux","url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"limitbar","aggr_limit":-2,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"limitbar","aggr_limit":0,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"limitbaz","aggr_limit":"4","url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            // aggr_proxy
            r#"{"aggr_id":"proxyquux","aggr_limit":4,"aggr_proxy":"example","url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            // aggr_timeout
            r#"{"aggr_id":"timeoutbar","aggr_limit":4,"aggr_timeout":null,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"timeoutqux","aggr_limit":4,"aggr_timeout":-2,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"timeoutqux","aggr_limit":4,"aggr_timeout":0,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"timeoutquux","aggr_limit":4,"aggr_timeout":"4","url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            // user_agent
            r#"{"aggr_id":"uafoo","aggr_limit":4,"user_agent":null,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
            r#"{"aggr_id":"uafoo","aggr_limit":4,"user_agent":3,"url":"http://foobar.com","callback_url":"http://foo.bar"}"#,
        ];

        for raw in cases {
            assert!(parse(raw).is_err(), "expected reject: {raw}");
        }
    }

    #[test]
    fn specific_rejection_reasons() {
        let cases = [
            (json!({"aggr_id": 7, "aggr_limit": 1, "url": "http://a/b", "callback_url": "http://c/d"}),
             ValidationError::AggrIdNotString),
            (json!({"aggr_id": "a", "aggr_limit": 1, "url": "ftp://a/b", "callback_url": "http://c/d"}),
             ValidationError::InvalidUrl),
            (json!({"aggr_id": "a", "aggr_limit": 1, "url": "http://a/b", "callback_url": "http://c/d", "aggr_timeout": "soon"}),
             ValidationError::TimeoutNotNumber),
            (json!({"aggr_id": "a", "aggr_limit": 1, "url": "http://a/b", "callback_url": "http://c/d", "extra": 9}),
             ValidationError::ExtraNotString),
        ];

        for (value, expected) in cases {
            assert_eq!(Submission::parse(&value).unwrap_err(), expected);
        }
    }

    #[test]
    fn parsed_fields_carry_through() {
        let value = json!({
            "aggr_id": "shop",
            "aggr_limit": 8,
            "aggr_proxy": "http://proxy.internal:3128",
            "aggr_timeout": 20,
            "url": "https://origin.example/asset.bin",
            "callback_url": "https://shop.example/hooks/dl",
            "extra": "order=1234",
            "user_agent": "shop-agent/2.0"
        });

        let submission = Submission::parse(&value).unwrap();
        assert_eq!(submission.aggregation.id, "shop");
        assert_eq!(submission.aggregation.limit, 8);
        assert_eq!(submission.aggregation.proxy, "http://proxy.internal:3128");
        assert_eq!(submission.aggregation.timeout_secs, 20);

        let job = submission.job("job-1".to_string());
        assert_eq!(job.id, "job-1");
        assert_eq!(job.aggr_id, "shop");
        assert_eq!(job.url, "https://origin.example/asset.bin");
        assert_eq!(job.extra, "order=1234");
        assert_eq!(job.user_agent, "shop-agent/2.0");
        assert_eq!(job.download_state, State::Pending);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn absent_timeout_uses_default() {
        let value = json!({
            "aggr_id": "t", "aggr_limit": 2,
            "url": "http://a/b", "callback_url": "http://c/d"
        });
        let submission = Submission::parse(&value).unwrap();
        assert_eq!(submission.aggregation.timeout_secs, 10);
    }
}
