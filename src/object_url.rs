// src/object_url.rs
//
// Tagged local/remote URL. All behavioral differences between filesystem
// paths and `s3://bucket/key` references derive from the scheme tag, and a
// URL is immutable once constructed: `join` returns a new value.
//
// Wildcard URLs carry the longest non-wildcard prefix (the server-side
// listing filter) and an anchored regex compiled from the remainder
// (`*` matches any run, `?` a single character).

use std::fmt;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use anyhow::{bail, Result};
use regex::Regex;

pub const S3_PREFIX: &str = "s3://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    S3,
    File,
}

#[derive(Debug, Clone)]
pub struct ObjectUrl {
    scheme: Scheme,
    bucket: String,
    path: String,
    prefix: String,
    delimiter: String,
    matcher: Option<Regex>,
}

fn has_glob(s: &str) -> bool {
    s.contains('*') || s.contains('?')
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern)
        .replace("\\*", ".*?")
        .replace("\\?", ".");
    Regex::new(&format!("^{escaped}$")).map_err(Into::into)
}

impl ObjectUrl {
    /// Parse a command token into a URL. Anything not starting with `s3://`
    /// is a local path.
    pub fn parse(s: &str) -> Result<ObjectUrl> {
        Self::parse_opts(s, false)
    }

    /// `recursive` forces a flat listing (no delimiter) on non-wildcard URLs.
    pub fn parse_opts(s: &str, recursive: bool) -> Result<ObjectUrl> {
        if s.is_empty() {
            bail!("empty URL");
        }

        let (scheme, bucket, path) = if let Some(rest) = s.strip_prefix(S3_PREFIX) {
            let (bucket, key) = match rest.split_once('/') {
                Some((b, k)) => (b, k),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                bail!("missing bucket name in {s:?}");
            }
            if has_glob(bucket) {
                bail!("wildcards are not allowed in bucket names: {s:?}");
            }
            (Scheme::S3, bucket.to_owned(), key.to_owned())
        } else {
            (Scheme::File, String::new(), s.to_owned())
        };

        let wild = has_glob(&path);
        let prefix = if wild {
            let cut = path.find(['*', '?']).unwrap_or(path.len());
            path[..cut].to_owned()
        } else {
            path.clone()
        };
        let delimiter = if wild || recursive {
            String::new()
        } else {
            "/".to_owned()
        };
        let matcher = if wild { Some(glob_to_regex(&path)?) } else { None };

        Ok(ObjectUrl {
            scheme,
            bucket,
            path,
            prefix,
            delimiter,
            matcher,
        })
    }

    /// A plain remote object reference (no wildcard interpretation).
    pub fn remote_object(bucket: &str, key: &str) -> ObjectUrl {
        ObjectUrl {
            scheme: Scheme::S3,
            bucket: bucket.to_owned(),
            path: key.to_owned(),
            prefix: key.to_owned(),
            delimiter: "/".to_owned(),
            matcher: None,
        }
    }

    /// A plain local path reference.
    pub fn local(path: impl Into<PathBuf>) -> ObjectUrl {
        let path = path.into().to_string_lossy().into_owned();
        ObjectUrl {
            scheme: Scheme::File,
            bucket: String::new(),
            prefix: path.clone(),
            delimiter: "/".to_owned(),
            matcher: None,
            path,
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The key (remote) or filesystem path (local).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Longest non-wildcard prefix, used as the server-side listing filter.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    pub fn is_remote(&self) -> bool {
        self.scheme != Scheme::File
    }

    pub fn is_wildcard(&self) -> bool {
        self.matcher.is_some()
    }

    /// Directory-like by spelling: empty key or trailing separator. Local
    /// destinations additionally consult filesystem metadata at the call site.
    pub fn is_dir_like(&self) -> bool {
        self.path.is_empty() || self.path.ends_with('/') || self.path.ends_with(MAIN_SEPARATOR)
    }

    /// The final path component.
    pub fn base(&self) -> String {
        match self.scheme {
            Scheme::S3 => {
                let trimmed = self.path.trim_end_matches('/');
                trimmed.rsplit('/').next().unwrap_or(trimmed).to_owned()
            }
            Scheme::File => Path::new(&self.path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    /// Append a suffix with the backend-appropriate separator.
    pub fn join(&self, suffix: &str) -> ObjectUrl {
        match self.scheme {
            Scheme::S3 => {
                let key = if self.path.is_empty() || self.path.ends_with('/') {
                    format!("{}{}", self.path, suffix)
                } else {
                    format!("{}/{}", self.path, suffix)
                };
                ObjectUrl::remote_object(&self.bucket, &key)
            }
            Scheme::File => ObjectUrl::local(Path::new(&self.path).join(suffix)),
        }
    }

    /// The directory portion of the listing prefix, including its trailing
    /// separator. Listed keys are reported relative to this.
    fn prefix_dir(&self) -> &str {
        match self.prefix.rfind(['/', MAIN_SEPARATOR]) {
            Some(pos) => &self.prefix[..=pos],
            None => "",
        }
    }

    /// Strip the prefix directory from a listed key for display and for
    /// `--parents` destination naming.
    pub fn relative(&self, key: &str) -> String {
        key.strip_prefix(self.prefix_dir()).unwrap_or(key).to_owned()
    }

    /// Filter a listed key against the compiled glob. Non-wildcard URLs
    /// accept every key under their prefix. Returns the relative form.
    pub fn match_key(&self, key: &str) -> Option<String> {
        match &self.matcher {
            Some(re) if !re.is_match(key) => None,
            _ => Some(self.relative(key)),
        }
    }

    /// `bucket/key` form used as an S3 copy source.
    pub fn copy_source(&self) -> String {
        format!("{}/{}", self.bucket, self.path)
    }

    /// The local path as a `Path`. Only meaningful for `Scheme::File`.
    pub fn as_path(&self) -> &Path {
        Path::new(&self.path)
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::S3 => write!(f, "{S3_PREFIX}{}/{}", self.bucket, self.path),
            Scheme::File => f.write_str(&self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_remote() {
        let url = ObjectUrl::parse("s3://bucket/some/key.txt").unwrap();
        assert!(url.is_remote());
        assert!(!url.is_wildcard());
        assert_eq!(url.bucket(), "bucket");
        assert_eq!(url.path(), "some/key.txt");
        assert_eq!(url.prefix(), "some/key.txt");
        assert_eq!(url.delimiter(), "/");
        assert_eq!(url.base(), "key.txt");
        assert_eq!(url.to_string(), "s3://bucket/some/key.txt");
    }

    #[test]
    fn parse_remote_bucket_only() {
        let url = ObjectUrl::parse("s3://bucket").unwrap();
        assert_eq!(url.bucket(), "bucket");
        assert_eq!(url.path(), "");
        assert!(url.is_dir_like());
    }

    #[test]
    fn parse_local() {
        let url = ObjectUrl::parse("/tmp/data/file.bin").unwrap();
        assert!(!url.is_remote());
        assert_eq!(url.path(), "/tmp/data/file.bin");
        assert_eq!(url.base(), "file.bin");
    }

    #[test]
    fn parse_rejects_empty_bucket() {
        assert!(ObjectUrl::parse("s3:///key").is_err());
        assert!(ObjectUrl::parse("s3://b*d/key").is_err());
    }

    #[test]
    fn wildcard_derivation() {
        let url = ObjectUrl::parse("s3://bucket/logs/2026/*.txt").unwrap();
        assert!(url.is_wildcard());
        assert_eq!(url.prefix(), "logs/2026/");
        assert_eq!(url.delimiter(), "");
        assert_eq!(url.match_key("logs/2026/a.txt").as_deref(), Some("a.txt"));
        assert_eq!(url.match_key("logs/2026/sub/b.txt").as_deref(), Some("sub/b.txt"));
        assert!(url.match_key("logs/2026/a.gz").is_none());
    }

    #[test]
    fn question_mark_matches_single_char() {
        let url = ObjectUrl::parse("s3://bucket/a?.txt").unwrap();
        assert!(url.match_key("ab.txt").is_some());
        assert!(url.match_key("abc.txt").is_none());
    }

    #[test]
    fn non_wildcard_match_is_prefix_relative() {
        let url = ObjectUrl::parse("s3://bucket/logs/").unwrap();
        assert_eq!(url.match_key("logs/a.txt").as_deref(), Some("a.txt"));
    }

    #[test]
    fn recursive_clears_delimiter() {
        let url = ObjectUrl::parse_opts("s3://bucket/logs/", true).unwrap();
        assert_eq!(url.delimiter(), "");
    }

    #[test]
    fn join_remote() {
        let dir = ObjectUrl::parse("s3://bucket/dir/").unwrap();
        assert_eq!(dir.join("x.txt").to_string(), "s3://bucket/dir/x.txt");
        let bare = ObjectUrl::parse("s3://bucket/dir").unwrap();
        assert_eq!(bare.join("x.txt").to_string(), "s3://bucket/dir/x.txt");
    }

    #[test]
    fn join_is_associative() {
        let url = ObjectUrl::parse("s3://bucket/a").unwrap();
        assert_eq!(
            url.join("b").join("c").to_string(),
            url.join("b/c").to_string()
        );
        let local = ObjectUrl::local("/tmp/a");
        let stepwise = local.join("b").join("c");
        let joined = local.join(&format!("b{MAIN_SEPARATOR}c"));
        assert_eq!(stepwise.as_path(), joined.as_path());
    }

    #[test]
    fn local_wildcard() {
        let url = ObjectUrl::parse("/tmp/out/*.log").unwrap();
        assert!(url.is_wildcard());
        assert!(!url.is_remote());
        assert_eq!(url.prefix(), "/tmp/out/");
        assert!(url.match_key("/tmp/out/a.log").is_some());
        assert!(url.match_key("/tmp/out/a.txt").is_none());
    }

    #[test]
    fn copy_source_form() {
        let url = ObjectUrl::parse("s3://bucket/k/v.bin").unwrap();
        assert_eq!(url.copy_source(), "bucket/k/v.bin");
    }
}
