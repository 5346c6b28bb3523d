//! Decoded query-string and form parameter maps

use crate::errors::HttpError;

/// Case-insensitive parameter map for query strings and urlencoded forms.
///
/// `+` decodes to space and percent-escapes are resolved. Duplicate keys are
/// joined with `,` at insertion, so `a=1&A=2` reads back as `"1,2"`.
/// Insertion order of first occurrences is preserved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParamMap {
    entries: Vec<(String, String)>,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes an `application/x-www-form-urlencoded` byte string.
    ///
    /// The raw input must be valid UTF-8; anything else is a protocol
    /// violation rather than silently replaced text.
    pub fn parse(input: &[u8]) -> Result<Self, HttpError> {
        let text = simdutf8::basic::from_utf8(input)
            .map_err(|_| HttpError::ProtocolViolation("urlencoded data is not valid utf-8".into()))?;

        let mut map = Self::new();
        for (key, value) in url::form_urlencoded::parse(text.as_bytes()) {
            map.insert(&key, &value);
        }
        Ok(map)
    }

    /// Inserts a decoded pair, joining case-insensitive duplicates with `,`.
    pub(crate) fn insert(&mut self, key: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, existing)) => {
                existing.push(',');
                existing.push_str(value);
            }
            None => self.entries.push((key.to_owned(), value.to_owned())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoding() {
        #[rustfmt::skip]
        let cases: [(&[u8], &[(&str, &str)]); 6] = [
            (b"a=1&b=two+words",        &[("a", "1"), ("b", "two words")]),
            (b"email=user%40host",      &[("email", "user@host")]),
            (b"flag&empty=",            &[("flag", ""), ("empty", "")]),
            (b"x=%C3%A9",               &[("x", "\u{e9}")]),
            (b"",                       &[]),
            (b"k=a%2Cb",                &[("k", "a,b")]),
        ];

        for (input, expected) in cases {
            let map = ParamMap::parse(input).unwrap();
            assert_eq!(map.len(), expected.len(), "{input:?}");
            for (key, value) in expected {
                assert_eq!(map.get(key), Some(*value), "{input:?} {key}");
            }
        }
    }

    #[test]
    fn duplicate_keys_join_with_comma() {
        let map = ParamMap::parse(b"a=1&A=2&a=3").unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("a"), Some("1,2,3"));
        assert_eq!(map.get("A"), Some("1,2,3"));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let map = ParamMap::parse(b"Token=abc").unwrap();
        assert_eq!(map.get("token"), Some("abc"));
        assert_eq!(map.get("TOKEN"), Some("abc"));
        assert!(!map.contains("tok"));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert!(matches!(
            ParamMap::parse(b"a=\xff\xfe"),
            Err(HttpError::ProtocolViolation(_))
        ));
    }
}
