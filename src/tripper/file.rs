use crate::error::GatewayError;
use crate::wrapper::{ApiResponse, ApiWrapper, BodySlot};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};

/// Serves a local file as the origin: `file://etc/files/data.json` reads
/// `etc/files/data.json` relative to the working directory.
pub fn trip(wrapper: &mut ApiWrapper) -> Result<ApiResponse, GatewayError> {
    let url = &wrapper.request.url;
    let path = format!("{}{}", url.host_str().unwrap_or(""), url.path());
    let body = std::fs::read(&path)
        .map_err(|e| GatewayError::Upstream(format!("not_found: {path}: {e}")))?;

    let mut headers = HeaderMap::new();
    let content_type = detect_content_type(&body, &path);
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    Ok(ApiResponse::from_parts(
        StatusCode::OK,
        headers,
        BodySlot::Buffered(Bytes::from(body)),
    ))
}

/// Minimalistic content-type detection: text is `text/plain` unless the
/// file name says JSON or XML, everything else is an octet stream.
fn detect_content_type(body: &[u8], file_name: &str) -> String {
    if std::str::from_utf8(body).is_ok() {
        if file_name.ends_with(".json") {
            return "application/json; charset=utf-8".to_string();
        }
        if file_name.ends_with(".xml") {
            return "text/xml; charset=utf-8".to_string();
        }
        return "text/plain; charset=utf-8".to_string();
    }
    "application/octet-stream".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::test_wrapper;

    #[test]
    fn test_detect_content_type() {
        assert!(detect_content_type(b"{\"a\":1}", "data.json").starts_with("application/json"));
        assert!(detect_content_type(b"<a/>", "data.xml").starts_with("text/xml"));
        assert!(detect_content_type(b"hello", "notes.txt").starts_with("text/plain"));
        assert_eq!(
            detect_content_type(&[0xff, 0xfe, 0x00, 0x01], "blob.bin"),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_file_trip_serves_bytes() {
        let dir = std::env::temp_dir().join(format!("file-trip-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("data.json");
        std::fs::write(&path, b"{\"ok\":true}").unwrap();

        let mut wrapper = test_wrapper();
        // file URLs address host+path relative to the working directory;
        // an absolute path has an empty host.
        wrapper.request.url = url::Url::parse(&format!("file://{}", path.display())).unwrap();
        let response = trip(&mut wrapper).unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body.bytes().unwrap().as_ref(), b"{\"ok\":true}");
        assert!(response
            .headers
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("application/json"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_errors() {
        let mut wrapper = test_wrapper();
        wrapper.request.url = url::Url::parse("file:///definitely/not/there.txt").unwrap();
        let err = trip(&mut wrapper).unwrap_err();
        assert!(err.to_string().contains("not_found"));
    }
}
