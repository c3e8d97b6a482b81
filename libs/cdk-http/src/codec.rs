//! Closed registry of wire formats.
//!
//! Each [`ContentType`] owns a canonical MIME string and a marshal/unmarshal pair.
//! MIME strings are matched after stripping parameters and lowercasing, so
//! `Application/JSON; charset=utf-8` selects [`ContentType::Json`].

use std::fmt;
use std::str::FromStr;

use http::HeaderMap;
use http::header::CONTENT_TYPE;
use serde::Serialize;
use serde::de::{DeserializeOwned, IntoDeserializer};

use crate::error::{BoxError, HttpError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Json,
    MsgPack,
    Yaml,
    Html,
    FormUrlEncoded,
    Plain,
}

impl ContentType {
    /// Every registered content type, in `Accept` order.
    pub const ALL: [ContentType; 6] = [
        ContentType::Json,
        ContentType::MsgPack,
        ContentType::Yaml,
        ContentType::Html,
        ContentType::FormUrlEncoded,
        ContentType::Plain,
    ];

    #[must_use]
    pub const fn mime(self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::MsgPack => "application/msgpack",
            ContentType::Yaml => "application/yaml",
            ContentType::Html => "text/html",
            ContentType::FormUrlEncoded => "application/x-www-form-urlencoded",
            ContentType::Plain => "text/plain",
        }
    }

    /// Resolve a `Content-Type` value, ignoring parameters.
    ///
    /// # Errors
    /// `UnsupportedContentType` when the media type is not registered.
    pub fn parse(value: &str) -> Result<Self, HttpError> {
        let essence = value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        Self::ALL
            .into_iter()
            .find(|ct| ct.mime() == essence)
            .ok_or_else(|| HttpError::UnsupportedContentType {
                content_type: value.trim().to_owned(),
            })
    }

    /// Resolve the `Content-Type` header of a request or response.
    ///
    /// # Errors
    /// `UnsupportedContentType` when the header is missing, not visible ASCII, or
    /// names an unregistered type.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, HttpError> {
        let value = headers
            .get(CONTENT_TYPE)
            .ok_or_else(|| HttpError::UnsupportedContentType {
                content_type: String::new(),
            })?;
        let value = value
            .to_str()
            .map_err(|_| HttpError::UnsupportedContentType {
                content_type: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            })?;
        Self::parse(value)
    }

    /// Encode `value` into wire bytes.
    ///
    /// Text types accept scalars (strings are written verbatim). The form type
    /// accepts a pre-encoded string or anything `serde_urlencoded` can flatten.
    ///
    /// # Errors
    /// `Marshal` when the value cannot be represented in this format.
    pub fn marshal<T>(self, value: &T) -> Result<Vec<u8>, HttpError>
    where
        T: Serialize + ?Sized,
    {
        let fail = |source: BoxError| HttpError::Marshal {
            content_type: self.mime(),
            source,
        };

        match self {
            ContentType::Json => serde_json::to_vec(value).map_err(|e| fail(e.into())),
            ContentType::MsgPack => rmp_serde::to_vec_named(value).map_err(|e| fail(e.into())),
            ContentType::Yaml => serde_yaml::to_string(value)
                .map(String::into_bytes)
                .map_err(|e| fail(e.into())),
            ContentType::Html | ContentType::Plain => {
                match serde_json::to_value(value).map_err(|e| fail(e.into()))? {
                    serde_json::Value::String(text) => Ok(text.into_bytes()),
                    serde_json::Value::Null => Ok(Vec::new()),
                    scalar @ (serde_json::Value::Bool(_) | serde_json::Value::Number(_)) => {
                        Ok(scalar.to_string().into_bytes())
                    }
                    _ => Err(fail("text payloads must be strings or scalars".into())),
                }
            }
            ContentType::FormUrlEncoded => {
                if let serde_json::Value::String(encoded) =
                    serde_json::to_value(value).map_err(|e| fail(e.into()))?
                {
                    return Ok(encoded.into_bytes());
                }
                serde_urlencoded::to_string(value)
                    .map(String::into_bytes)
                    .map_err(|e| fail(e.into()))
            }
        }
    }

    /// Decode wire bytes into `T`.
    ///
    /// Text types deserialize from the body as one string, so `T` is typically
    /// `String`.
    ///
    /// # Errors
    /// `Unmarshal` when the bytes are not valid for this format or for `T`.
    pub fn unmarshal<T>(self, bytes: &[u8]) -> Result<T, HttpError>
    where
        T: DeserializeOwned,
    {
        let fail = |source: BoxError| HttpError::Unmarshal {
            content_type: self.mime(),
            source,
        };

        match self {
            ContentType::Json => serde_json::from_slice(bytes).map_err(|e| fail(e.into())),
            ContentType::MsgPack => rmp_serde::from_slice(bytes).map_err(|e| fail(e.into())),
            ContentType::Yaml => serde_yaml::from_slice(bytes).map_err(|e| fail(e.into())),
            ContentType::FormUrlEncoded => {
                serde_urlencoded::from_bytes(bytes).map_err(|e| fail(e.into()))
            }
            ContentType::Html | ContentType::Plain => {
                let text = std::str::from_utf8(bytes).map_err(|e| fail(e.into()))?;
                let de: serde::de::value::StrDeserializer<'_, serde::de::value::Error> =
                    text.into_deserializer();
                T::deserialize(de).map_err(|e| fail(e.into()))
            }
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

impl FromStr for ContentType {
    type Err = HttpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::HeaderValue;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Inventory {
        name: String,
        count: u32,
        tags: Vec<String>,
        attributes: BTreeMap<String, Vec<i64>>,
        nested: Option<Box<Inventory>>,
    }

    fn sample() -> Inventory {
        Inventory {
            name: "warehouse".to_owned(),
            count: 3,
            tags: vec!["a".to_owned(), "b".to_owned()],
            attributes: BTreeMap::from([
                ("dims".to_owned(), vec![1, 2, 3]),
                ("empty".to_owned(), vec![]),
            ]),
            nested: Some(Box::new(Inventory {
                name: "shelf".to_owned(),
                count: 0,
                tags: vec![],
                attributes: BTreeMap::new(),
                nested: None,
            })),
        }
    }

    #[test]
    fn test_parse_strips_parameters_and_case() {
        assert_eq!(
            ContentType::parse("Application/JSON; charset=utf-8").unwrap(),
            ContentType::Json
        );
        assert_eq!(
            ContentType::parse(" text/plain ;format=flowed").unwrap(),
            ContentType::Plain
        );
        assert_eq!(
            "application/x-www-form-urlencoded"
                .parse::<ContentType>()
                .unwrap(),
            ContentType::FormUrlEncoded
        );
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = ContentType::parse("image/png").unwrap_err();
        assert!(matches!(
            err,
            HttpError::UnsupportedContentType { content_type } if content_type == "image/png"
        ));
    }

    #[test]
    fn test_from_headers_missing() {
        let err = ContentType::from_headers(&HeaderMap::new()).unwrap_err();
        assert!(matches!(err, HttpError::UnsupportedContentType { .. }));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/yaml"));
        assert_eq!(ContentType::from_headers(&headers).unwrap(), ContentType::Yaml);
    }

    #[test]
    fn test_structured_round_trips() {
        let value = sample();
        for ct in [ContentType::Json, ContentType::Yaml, ContentType::MsgPack] {
            let bytes = ct.marshal(&value).unwrap();
            let back: Inventory = ct.unmarshal(&bytes).unwrap();
            assert_eq!(back, value, "round trip through {ct}");
        }
    }

    #[test]
    fn test_text_round_trips() {
        for ct in [ContentType::Plain, ContentType::Html] {
            let bytes = ct.marshal("<p>héllo</p>").unwrap();
            assert_eq!(bytes, "<p>héllo</p>".as_bytes());
            let back: String = ct.unmarshal(&bytes).unwrap();
            assert_eq!(back, "<p>héllo</p>");
        }
    }

    #[test]
    fn test_text_scalars_and_rejects_structures() {
        assert_eq!(ContentType::Plain.marshal(&42).unwrap(), b"42");
        assert_eq!(ContentType::Plain.marshal(&true).unwrap(), b"true");
        assert!(matches!(
            ContentType::Plain.marshal(&sample()),
            Err(HttpError::Marshal { content_type: "text/plain", .. })
        ));
    }

    #[test]
    fn test_form_round_trip() {
        let form = BTreeMap::from([
            ("q".to_owned(), "rust lang".to_owned()),
            ("page".to_owned(), "2".to_owned()),
        ]);
        let bytes = ContentType::FormUrlEncoded.marshal(&form).unwrap();
        assert_eq!(bytes, b"page=2&q=rust+lang");

        let back: BTreeMap<String, String> =
            ContentType::FormUrlEncoded.unmarshal(&bytes).unwrap();
        assert_eq!(back, form);
    }

    #[test]
    fn test_form_accepts_preencoded_string() {
        let bytes = ContentType::FormUrlEncoded.marshal("a=1&b=2").unwrap();
        assert_eq!(bytes, b"a=1&b=2");
    }

    #[test]
    fn test_unmarshal_reports_content_type() {
        let err = ContentType::Json
            .unmarshal::<Inventory>(b"{not json")
            .unwrap_err();
        assert!(matches!(
            err,
            HttpError::Unmarshal {
                content_type: "application/json",
                ..
            }
        ));
    }
}
