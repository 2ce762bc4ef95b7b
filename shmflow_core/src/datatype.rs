//! MIME-like datatype descriptors carried alongside frames.
//!
//! A descriptor names a media type plus free-form parameters, in the caps
//! style used by media pipelines: `application/x-raw,fun=yes` or
//! `video/x-raw, format=BGR, height=480`. Readers receive both the raw
//! string and this parsed form.

use crate::error::{ShmError, ShmResult};

/// Parsed form of a datatype descriptor.
///
/// Parameters keep their declaration order; lookup by key is linear, which
/// is fine for the handful of parameters real descriptors carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datatype {
    raw: String,
    media_type: String,
    subtype: String,
    params: Vec<(String, String)>,
}

impl Datatype {
    /// Parse a descriptor of the form `type/subtype[,key=value]*`.
    pub fn parse(raw: &str) -> ShmResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ShmError::InvalidDatatype {
                detail: "empty descriptor".into(),
            });
        }

        let mut parts = raw.split(',');
        let mime = parts.next().unwrap_or("").trim();
        let (media_type, subtype) = match mime.split_once('/') {
            Some((t, s)) if !t.is_empty() && !s.is_empty() => (t.trim(), s.trim()),
            _ => {
                return Err(ShmError::InvalidDatatype {
                    detail: format!("'{mime}' is not a type/subtype pair"),
                })
            }
        };

        let mut params = Vec::new();
        for item in parts {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match item.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() => {
                    params.push((k.trim().to_string(), v.trim().to_string()));
                }
                _ => {
                    return Err(ShmError::InvalidDatatype {
                        detail: format!("parameter '{item}' is not key=value"),
                    })
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            media_type: media_type.to_string(),
            subtype: subtype.to_string(),
            params,
        })
    }

    /// The descriptor exactly as the writer declared it.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// Parameters in declaration order.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Look up a parameter value by key.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Display for Datatype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
