//! Ordered, case-insensitive header storage

use crate::errors::HttpError;
use std::sync::{Mutex, PoisonError};

/// Longest accepted header name.
pub const MAX_NAME_LEN: usize = 16_384;
/// Longest accepted header value.
pub const MAX_VALUE_LEN: usize = 32_768;

/// A single header entry. Immutable once stored; replacing a value means
/// replacing the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    value: String,
}

impl Header {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// The rule by which a collection rewrites header names at insertion.
///
/// Lookup is case-insensitive under every policy; normalization only decides
/// what goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderCase {
    /// `content-type` becomes `Content-Type` (HTTP/1.1 wire convention).
    #[default]
    Title,
    /// Everything lower-cased (HTTP/2-style).
    Lower,
    /// Names kept exactly as given. Intended for tests.
    Preserve,
}

impl HeaderCase {
    /// Applies the policy. Idempotent for every variant.
    pub fn normalize(&self, name: &str) -> String {
        match self {
            HeaderCase::Preserve => name.to_owned(),
            HeaderCase::Lower => name.to_ascii_lowercase(),
            HeaderCase::Title => {
                let mut out = String::with_capacity(name.len());
                let mut start_of_word = true;
                for c in name.chars() {
                    if start_of_word {
                        out.push(c.to_ascii_uppercase());
                    } else {
                        out.push(c.to_ascii_lowercase());
                    }
                    start_of_word = c == '-';
                }
                out
            }
        }
    }
}

/// Ordered multimap of headers with case-insensitive keyed access.
///
/// Entries keep insertion order; duplicates are permitted, except that
/// sequential `Cookie` additions are merged into the first `Cookie` entry
/// with `"; "`. All access goes through one internal lock, so a shared
/// reference is enough to mutate the collection.
#[derive(Debug, Default)]
pub struct HeaderCollection {
    case: HeaderCase,
    entries: Mutex<Vec<Header>>,
}

impl HeaderCollection {
    pub fn new(case: HeaderCase) -> Self {
        Self {
            case,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn case(&self) -> HeaderCase {
        self.case
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Header>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn validate(name: &str, value: &str) -> Result<(), HttpError> {
        if name.is_empty() {
            return Err(HttpError::BadHeader("empty header name".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(HttpError::BadHeader(format!(
                "header name of {} bytes exceeds the {MAX_NAME_LEN} byte cap",
                name.len()
            )));
        }
        if let Some(bad) = name
            .bytes()
            .find(|b| !(0x20..0x7f).contains(b) || *b == b':')
        {
            return Err(HttpError::BadHeader(format!(
                "header name contains disallowed byte 0x{bad:02x}"
            )));
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(HttpError::BadHeader(format!(
                "header value of {} bytes exceeds the {MAX_VALUE_LEN} byte cap",
                value.len()
            )));
        }
        Ok(())
    }

    /// Appends a header, merging sequential `Cookie` entries.
    pub fn add(&self, name: &str, value: &str) -> Result<(), HttpError> {
        Self::validate(name, value)?;
        let name = self.case.normalize(name);
        let mut entries = self.lock();

        if name.eq_ignore_ascii_case("cookie") {
            if let Some(existing) = entries
                .iter_mut()
                .find(|h| h.name.eq_ignore_ascii_case("cookie"))
            {
                let merged = format!("{}; {}", existing.value, value);
                existing.value = merged;
                return Ok(());
            }
        }

        entries.push(Header {
            name,
            value: value.to_owned(),
        });
        Ok(())
    }

    /// Bulk merge; each pair goes through [`add`](Self::add).
    pub fn merge<I, N, V>(&self, headers: I) -> Result<(), HttpError>
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in headers {
            self.add(name.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    /// Replaces the value of `name`, keeping the first occurrence's position
    /// and removing later duplicates. `None` erases the header entirely.
    pub fn set(&self, name: &str, value: Option<&str>) -> Result<(), HttpError> {
        let Some(value) = value else {
            self.remove(name);
            return Ok(());
        };
        Self::validate(name, value)?;
        let normalized = self.case.normalize(name);
        let mut entries = self.lock();

        let Some(first) = entries.iter().position(|h| h.name.eq_ignore_ascii_case(name)) else {
            entries.push(Header {
                name: normalized,
                value: value.to_owned(),
            });
            return Ok(());
        };

        entries[first] = Header {
            name: normalized,
            value: value.to_owned(),
        };
        let mut index = first + 1;
        while index < entries.len() {
            if entries[index].name.eq_ignore_ascii_case(name) {
                entries.remove(index);
            } else {
                index += 1;
            }
        }
        Ok(())
    }

    /// Removes every entry named `name`.
    pub fn remove(&self, name: &str) {
        self.lock().retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    /// All values for `name` joined with `", "`, or `None` when absent.
    pub fn get(&self, name: &str) -> Option<String> {
        let entries = self.lock();
        let mut matches = entries
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str());

        let first = matches.next()?;
        let mut joined = first.to_owned();
        for value in matches {
            joined.push_str(", ");
            joined.push_str(value);
        }
        Some(joined)
    }

    /// Every value for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().iter().any(|h| h.name.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// A point-in-time copy of the entries, taken under the lock.
    pub fn snapshot(&self) -> Vec<Header> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Applies a raw `Name: value` line.
    ///
    /// The value is everything after the first `:` with leading spaces
    /// stripped. A line without `:` removes every header matching the raw
    /// text instead.
    pub fn assign_from_line(&self, line: &str) -> Result<(), HttpError> {
        match line.split_once(':') {
            Some((name, value)) => self.add(name, value.trim_start_matches(' ')),
            None => {
                self.remove(line);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod normalize_tests {
    use super::*;

    #[test]
    fn policies() {
        #[rustfmt::skip]
        let cases = [
            (HeaderCase::Title, "content-type", "Content-Type"),
            (HeaderCase::Title, "CONTENT-TYPE", "Content-Type"),
            (HeaderCase::Title, "x-forwarded-for", "X-Forwarded-For"),
            (HeaderCase::Title, "etag", "Etag"),
            (HeaderCase::Lower, "Content-Type", "content-type"),
            (HeaderCase::Lower, "ETag", "etag"),
            (HeaderCase::Preserve, "wEiRd-CaSe", "wEiRd-CaSe"),
        ];

        for (case, input, expected) in cases {
            assert_eq!(case.normalize(input), expected);
        }
    }

    #[test]
    fn normalization_is_idempotent() {
        for case in [HeaderCase::Title, HeaderCase::Lower, HeaderCase::Preserve] {
            for name in ["Content-Type", "x-real-ip", "UPGRADE", "a--b", "-x-"] {
                let once = case.normalize(name);
                assert_eq!(case.normalize(&once), once, "{case:?} {name}");
            }
        }
    }
}
