//! Line-delimited JSON protocol spoken by the OCR engine
//!
//! Request: `{"image_path": "<absolute path>"}` followed by a newline.
//! Response: `{"code": <int>, "data": [...] | "<message>"}` on one line.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::error::{OcrRenameError, Result};

/// Status code for a successful recognition
pub const CODE_SUCCESS: i64 = 100;

/// Status code for "image read fine but contained no text"
pub const CODE_NO_TEXT: i64 = 101;

/// A single recognition request
#[derive(Debug, Clone, Serialize)]
pub struct EngineRequest {
    pub image_path: String,
}

impl EngineRequest {
    pub fn for_path(path: &Path) -> Self {
        Self {
            image_path: path.to_string_lossy().into_owned(),
        }
    }

    /// Encode as one newline-terminated line with non-ASCII characters escaped
    pub fn to_line(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        let mut line = escape_non_ascii(&json);
        line.push('\n');
        Ok(line)
    }
}

/// One recognized text box
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextFragment {
    pub text: String,
    #[serde(default, rename = "score")]
    pub confidence: f64,
    #[serde(default, rename = "box")]
    pub bounding_box: Vec<[f64; 2]>,
}

/// Decoded engine response
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResponse {
    pub status_code: i64,
    pub fragments: Vec<TextFragment>,
    /// Explanatory text for non-success codes
    pub message: Option<String>,
}

#[derive(Deserialize)]
struct RawResponse {
    code: Option<i64>,
    #[serde(default)]
    data: Value,
}

impl EngineResponse {
    /// Parse one response line
    pub fn parse_line(line: &str) -> Result<Self> {
        let raw: RawResponse = serde_json::from_str(line.trim()).map_err(|e| {
            OcrRenameError::EngineProtocol(format!("invalid JSON response ({e}): {}", preview(line)))
        })?;

        let status_code = raw.code.ok_or_else(|| {
            OcrRenameError::EngineProtocol(format!("response has no \"code\": {}", preview(line)))
        })?;

        match status_code {
            CODE_SUCCESS => {
                let Value::Array(items) = raw.data else {
                    return Err(OcrRenameError::EngineProtocol(format!(
                        "success response without a data array: {}",
                        preview(line)
                    )));
                };
                // Entries without a text field carry nothing we use
                let fragments = items
                    .into_iter()
                    .filter_map(|item| serde_json::from_value::<TextFragment>(item).ok())
                    .collect();
                Ok(Self {
                    status_code,
                    fragments,
                    message: None,
                })
            }
            _ => {
                let message = match raw.data {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                Ok(Self {
                    status_code,
                    fragments: Vec::new(),
                    message: Some(message),
                })
            }
        }
    }

    /// Recognized text joined in array order
    pub fn joined_text(&self, separator: &str) -> String {
        self.fragments
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join(separator)
    }

    /// Interpret the status code: text on success, an error otherwise
    pub fn into_text(self, separator: &str) -> Result<String> {
        match self.status_code {
            CODE_SUCCESS => Ok(self.joined_text(separator)),
            CODE_NO_TEXT => Ok(String::new()),
            code => Err(OcrRenameError::EngineReported {
                code,
                message: self.message.unwrap_or_default(),
            }),
        }
    }
}

/// Replace every non-ASCII char with `\uXXXX` escapes (surrogate pairs above the BMP)
fn escape_non_ascii(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

fn preview(line: &str) -> String {
    const MAX: usize = 120;
    let trimmed = line.trim();
    if trimmed.chars().count() > MAX {
        let cut: String = trimmed.chars().take(MAX).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}
