use url::Url;

use crate::error::FieldIssue;

/// Input contract of a procedure, checked after decoding and before the handler runs.
pub trait Validate {
    fn validate(&self) -> Result<(), Vec<FieldIssue>>;
}

impl Validate for () {
    fn validate(&self) -> Result<(), Vec<FieldIssue>> {
        Ok(())
    }
}

/// Collects every violated constraint so callers see all of them at once.
#[derive(Debug, Default)]
pub struct Issues(Vec<FieldIssue>);

impl Issues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: &str, message: impl Into<String>) -> &mut Self {
        self.0.push(FieldIssue::new(path, message));
        self
    }

    /// Length in characters, both bounds inclusive.
    pub fn length(&mut self, path: &str, value: &str, min: usize, max: Option<usize>) -> &mut Self {
        let len = value.chars().count();
        if len < min {
            if min == 1 {
                self.push(path, "must not be empty");
            } else {
                self.push(path, format!("must be at least {min} characters"));
            }
        } else if let Some(max) = max.filter(|max| len > *max) {
            self.push(path, format!("must be at most {max} characters"));
        }
        self
    }

    pub fn range(&mut self, path: &str, value: i64, min: i64, max: i64) -> &mut Self {
        if value < min || value > max {
            self.push(path, format!("must be between {min} and {max}"));
        }
        self
    }

    /// Absolute http(s) URL.
    pub fn url(&mut self, path: &str, value: &str) -> &mut Self {
        match Url::parse(value) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                self.push(path, "must be a valid URL");
            }
        }
        self
    }

    /// `local@domain.tld` with no whitespace.
    pub fn email(&mut self, path: &str, value: &str) -> &mut Self {
        let valid = value
            .split_once('@')
            .is_some_and(|(local, domain)| {
                !local.is_empty()
                    && !domain.contains('@')
                    && domain
                        .split_once('.')
                        .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
                    && !domain.ends_with('.')
            })
            && !value.chars().any(char::is_whitespace);
        if !valid {
            self.push(path, "must be a valid email address");
        }
        self
    }

    pub fn finish(self) -> Result<(), Vec<FieldIssue>> {
        if self.0.is_empty() { Ok(()) } else { Err(self.0) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_every_issue() {
        let mut issues = Issues::new();
        issues
            .length("title", "", 1, Some(200))
            .length("content", &"x".repeat(5), 1, None)
            .range("limit", 0, 1, 100)
            .url("imageUrl", "ftp://example.com/a.png");
        let issues = issues.finish().unwrap_err();
        let paths: Vec<_> = issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, ["title", "limit", "imageUrl"]);
        assert_eq!(issues[0].message, "must not be empty");
    }

    #[test]
    fn email_shape() {
        for ok in ["ada@example.com", "a.b+c@mail.example.org"] {
            let mut issues = Issues::new();
            issues.email("email", ok);
            assert!(issues.finish().is_ok(), "{ok}");
        }
        for bad in ["", "ada", "@example.com", "ada@", "ada@example", "ada@example.", "a da@example.com", "a@b@c.com"] {
            let mut issues = Issues::new();
            issues.email("email", bad);
            assert!(issues.finish().is_err(), "{bad}");
        }
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let mut issues = Issues::new();
        issues.length("title", &"é".repeat(200), 1, Some(200));
        assert!(issues.finish().is_ok());
    }
}
