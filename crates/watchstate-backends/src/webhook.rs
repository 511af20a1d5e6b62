use crate::error::BackendError;
use serde_json::Value;

/// A webhook HTTP request as the outside world hands it to the core: method,
/// headers, and raw body. The router is external; only the parsing contract
/// lives here.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: "POST".to_string(),
            content_type: "application/json".to_string(),
            body: body.into(),
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type.starts_with("multipart/form-data")
    }
}

/// Identity extracted from a webhook payload before full parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttributes {
    pub user_id: Option<String>,
    pub backend_id: Option<String>,
}

/// Look up a `/`-separated path in decoded JSON, e.g. `Account/id`.
///
/// This is the only dynamic accessor in the engine; everything beyond webhook
/// payload probing uses typed structs.
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('/') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub fn json_path_str<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    json_path(value, path).and_then(Value::as_str)
}

pub fn json_path_i64(value: &Value, path: &str) -> Option<i64> {
    let found = json_path(value, path)?;
    found
        .as_i64()
        .or_else(|| found.as_str().and_then(|s| s.parse().ok()))
}

pub fn json_path_bool(value: &Value, path: &str) -> Option<bool> {
    json_path(value, path).and_then(Value::as_bool)
}

/// Extract the named field from a `multipart/form-data` body.
///
/// Plex posts webhooks as multipart with a JSON part named `payload`; this
/// walks the boundary-delimited parts without buffering beyond the body the
/// caller already holds.
pub fn multipart_field(content_type: &str, body: &[u8], field: &str) -> Result<Vec<u8>, BackendError> {
    let boundary = content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .ok_or_else(|| BackendError::validation("multipart body without boundary"))?;

    let delimiter = format!("--{boundary}");

    let mut cursor = 0;
    while let Some(start) = find_subsequence(&body[cursor..], delimiter.as_bytes()) {
        let part_start = cursor + start + delimiter.len();
        // Closing delimiter is `--boundary--`.
        if body[part_start..].starts_with(b"--") {
            break;
        }
        let rest = &body[part_start..];
        let header_end = match find_subsequence(rest, b"\r\n\r\n") {
            Some(pos) => pos,
            None => break,
        };
        let headers = String::from_utf8_lossy(&rest[..header_end]);
        let body_start = header_end + 4;
        let body_end = find_subsequence(&rest[body_start..], delimiter.as_bytes())
            .map(|pos| body_start + pos)
            .unwrap_or(rest.len());

        let is_wanted = headers
            .lines()
            .any(|line| {
                line.to_ascii_lowercase().starts_with("content-disposition")
                    && (line.contains(&format!("name=\"{field}\""))
                        || line.contains(&format!("name={field}")))
            });
        if is_wanted {
            let mut content = &rest[body_start..body_end];
            // Strip the trailing CRLF that precedes the next delimiter.
            if content.ends_with(b"\r\n") {
                content = &content[..content.len() - 2];
            }
            return Ok(content.to_vec());
        }
        cursor = part_start + body_end;
    }

    Err(BackendError::validation(format!("multipart body has no '{field}' field")))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
