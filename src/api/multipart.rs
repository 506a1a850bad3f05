//! Minimal multipart/form-data parser for uploaded frames.
//!
//! Only what the endpoint layer needs: named parts with raw bytes. Nested
//! multipart and transfer encodings are rejected by construction (we never
//! decode part bodies).

use anyhow::{anyhow, Result};

#[derive(Clone, Debug)]
pub struct MultipartPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Extract the boundary token from a Content-Type header value.
pub fn boundary_from_content_type(value: &str) -> Option<String> {
    let mut segments = value.split(';');
    let media_type = segments.next()?.trim();
    if !media_type.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    for segment in segments {
        let segment = segment.trim();
        if let Some(boundary) = segment.strip_prefix("boundary=") {
            let boundary = boundary.trim_matches('"');
            if !boundary.is_empty() {
                return Some(boundary.to_string());
            }
        }
    }
    None
}

/// Parse a multipart body into its parts.
pub fn parse(body: &[u8], boundary: &str) -> Result<Vec<MultipartPart>> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut parts = Vec::new();
    let mut pos = find(body, delimiter, 0).ok_or_else(|| anyhow!("missing opening boundary"))?;
    pos += delimiter.len();

    loop {
        if body[pos..].starts_with(b"--") {
            break; // closing delimiter
        }
        if !body[pos..].starts_with(b"\r\n") {
            return Err(anyhow!("malformed boundary delimiter"));
        }
        pos += 2;

        let headers_end = find(body, b"\r\n\r\n", pos)
            .ok_or_else(|| anyhow!("part headers not terminated"))?;
        let headers = std::str::from_utf8(&body[pos..headers_end])
            .map_err(|_| anyhow!("part headers are not valid UTF-8"))?;
        let (name, filename, content_type) = parse_part_headers(headers)?;

        let data_start = headers_end + 4;
        let mut next = find(body, delimiter, data_start)
            .ok_or_else(|| anyhow!("part not terminated by boundary"))?;
        // part data ends with \r\n before the delimiter
        if next < data_start + 2 || &body[next - 2..next] != b"\r\n" {
            return Err(anyhow!("part data not CRLF-terminated"));
        }
        let data = body[data_start..next - 2].to_vec();
        parts.push(MultipartPart {
            name,
            filename,
            content_type,
            data,
        });
        next += delimiter.len();
        pos = next;
    }

    Ok(parts)
}

/// First part with the given field name.
pub fn field<'a>(parts: &'a [MultipartPart], name: &str) -> Option<&'a MultipartPart> {
    parts.iter().find(|part| part.name == name)
}

fn parse_part_headers(headers: &str) -> Result<(String, Option<String>, Option<String>)> {
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;
    for line in headers.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if key == "content-type" {
            content_type = Some(value.to_string());
        } else if key == "content-disposition" {
            for attr in value.split(';') {
                let attr = attr.trim();
                if let Some(v) = attr.strip_prefix("name=") {
                    name = Some(v.trim_matches('"').to_string());
                } else if let Some(v) = attr.strip_prefix("filename=") {
                    filename = Some(v.trim_matches('"').to_string());
                }
            }
        }
    }
    let name = name.ok_or_else(|| anyhow!("part missing field name"))?;
    Ok((name, filename, content_type))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(boundary: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(
            format!(
                "--{boundary}\r\n\
                 Content-Disposition: form-data; name=\"roll_number\"\r\n\r\n\
                 42\r\n\
                 --{boundary}\r\n\
                 Content-Disposition: form-data; name=\"image\"; filename=\"frame.jpg\"\r\n\
                 Content-Type: image/jpeg\r\n\r\n"
            )
            .as_bytes(),
        );
        out.extend_from_slice(&[0xff, 0xd8, 0x00, 0x0d, 0x0a, 0xff]);
        out.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        out
    }

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=XyZ"),
            Some("XyZ".to_string())
        );
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=\"quoted\""),
            Some("quoted".to_string())
        );
        assert_eq!(boundary_from_content_type("application/json"), None);
        assert_eq!(boundary_from_content_type("multipart/form-data"), None);
    }

    #[test]
    fn parses_fields_and_binary_payload() {
        let parts = parse(&body("boundary123"), "boundary123").unwrap();
        assert_eq!(parts.len(), 2);

        let roll = field(&parts, "roll_number").unwrap();
        assert_eq!(roll.data, b"42");
        assert!(roll.filename.is_none());

        let image = field(&parts, "image").unwrap();
        assert_eq!(image.filename.as_deref(), Some("frame.jpg"));
        assert_eq!(image.content_type.as_deref(), Some("image/jpeg"));
        // binary data containing CRLF bytes survives intact
        assert_eq!(image.data, vec![0xff, 0xd8, 0x00, 0x0d, 0x0a, 0xff]);

        assert!(field(&parts, "missing").is_none());
    }

    #[test]
    fn rejects_truncated_body() {
        let mut data = body("b");
        data.truncate(data.len() / 2);
        assert!(parse(&data, "b").is_err());
    }

    #[test]
    fn rejects_wrong_boundary() {
        assert!(parse(&body("b1"), "b2").is_err());
    }
}
