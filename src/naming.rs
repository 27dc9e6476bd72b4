//! Bucket Naming Resolver
//!
//! Maps caller-facing bucket names onto keyspace keys.
//!
//! A bucket name without an application qualifier belongs to the calling
//! application: `"users"` resolves to `"{app}.users"`. A qualified name
//! `"billing.invoices"` addresses another application's bucket directly, which
//! lets one application invalidate buckets declared by another. Glob
//! characters make a name a wildcard (`"*"`, `"billing.*"`), expanded against
//! the keyspace when a purge runs; wildcards are never stored.
//!
//! Key layout, for environment `env`:
//! - named bucket: `BUCKET.{env}.{app}.{name}`
//! - GLOBAL index: `BUCKET.{env}.{app}.GLOBAL`

use std::fmt;

use crate::error::{CacheError, Result};
use crate::keyspace::pattern;

/// Reserved bucket name of the per-application reverse index.
pub const GLOBAL_BUCKET: &str = "GLOBAL";

/// Prefix shared by every bucket key.
pub const BUCKET_KEY_PREFIX: &str = "BUCKET.";

// == Qualified Bucket ==
/// A bucket name bound to its owning application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedBucket {
    pub app: String,
    pub name: String,
}

impl QualifiedBucket {
    /// True when the name holds glob characters.
    pub fn is_wildcard(&self) -> bool {
        pattern::is_pattern(&self.app) || pattern::is_pattern(&self.name)
    }
}

/// Renders the short name `{app}.{name}` stored in GLOBAL tuples.
impl fmt::Display for QualifiedBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app, self.name)
    }
}

// == Bucket Namespace ==
/// Resolves bucket names for one application in one environment.
#[derive(Debug, Clone)]
pub struct BucketNamespace {
    env: String,
    app: String,
}

impl BucketNamespace {
    pub fn new(env: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            env: env.into(),
            app: app.into(),
        }
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    // == Qualify ==
    /// Binds a caller-facing name to its application.
    ///
    /// The first `.` separates an explicit application from the bucket name.
    pub fn qualify(&self, name: &str) -> Result<QualifiedBucket> {
        if name.is_empty() {
            return Err(CacheError::Validation(
                "Bucket names must be non-empty".to_string(),
            ));
        }
        let qualified = match name.split_once('.') {
            Some((app, bucket)) if !app.is_empty() && !bucket.is_empty() => QualifiedBucket {
                app: app.to_string(),
                name: bucket.to_string(),
            },
            Some(_) => {
                return Err(CacheError::Validation(format!(
                    "Malformed qualified bucket name: {}",
                    name
                )))
            }
            None => QualifiedBucket {
                app: self.app.clone(),
                name: name.to_string(),
            },
        };
        let last_segment = qualified.name.rsplit('.').next().unwrap_or_default();
        if last_segment == GLOBAL_BUCKET {
            return Err(CacheError::Validation(format!(
                "{} is a reserved bucket name",
                GLOBAL_BUCKET
            )));
        }
        Ok(qualified)
    }

    /// Resolves the buckets an entry is written into.
    ///
    /// Wildcards are rejected; duplicates are dropped keeping first occurrence.
    pub fn resolve_for_set(&self, names: &[String]) -> Result<Vec<QualifiedBucket>> {
        let mut resolved: Vec<QualifiedBucket> = Vec::with_capacity(names.len());
        for name in names {
            let bucket = self.qualify(name)?;
            if bucket.is_wildcard() {
                return Err(CacheError::Validation(format!(
                    "Wildcard buckets cannot be written to: {}",
                    name
                )));
            }
            if !resolved.contains(&bucket) {
                resolved.push(bucket);
            }
        }
        Ok(resolved)
    }

    /// Resolves purge targets to key patterns; literal names become literal keys.
    pub fn resolve_for_purge(&self, names: &[String]) -> Result<Vec<BucketTarget>> {
        names
            .iter()
            .map(|name| {
                let bucket = self.qualify(name)?;
                Ok(if bucket.is_wildcard() {
                    BucketTarget::Pattern(format!(
                        "{}{}.{}.{}",
                        BUCKET_KEY_PREFIX,
                        pattern::escape(&self.env),
                        bucket.app,
                        bucket.name
                    ))
                } else {
                    BucketTarget::Key(self.bucket_key(&bucket))
                })
            })
            .collect()
    }

    // == Keys ==
    pub fn bucket_key(&self, bucket: &QualifiedBucket) -> String {
        format!(
            "{}{}.{}.{}",
            BUCKET_KEY_PREFIX, self.env, bucket.app, bucket.name
        )
    }

    /// Key of a bucket given its short name `{app}.{name}`.
    pub fn bucket_key_for_short(&self, short_name: &str) -> String {
        format!("{}{}.{}", BUCKET_KEY_PREFIX, self.env, short_name)
    }

    /// Key of this application's GLOBAL index.
    pub fn global_key(&self) -> String {
        format!(
            "{}{}.{}.{}",
            BUCKET_KEY_PREFIX, self.env, self.app, GLOBAL_BUCKET
        )
    }

    /// Pattern matching every bucket key of the environment, GLOBAL indexes included.
    pub fn environment_pattern(&self) -> String {
        format!("{}{}.*", BUCKET_KEY_PREFIX, pattern::escape(&self.env))
    }

    /// Short name `{app}.{name}` of a bucket key in this environment.
    pub fn short_name<'a>(&self, bucket_key: &'a str) -> Option<&'a str> {
        bucket_key
            .strip_prefix(BUCKET_KEY_PREFIX)?
            .strip_prefix(self.env.as_str())?
            .strip_prefix('.')
    }

    /// True if the key is a bucket or GLOBAL key (of any environment).
    pub fn is_bucket_key(key: &str) -> bool {
        key.starts_with(BUCKET_KEY_PREFIX)
    }

    /// True if the key names a GLOBAL index.
    pub fn is_global_key(key: &str) -> bool {
        Self::is_bucket_key(key)
            && key
                .rsplit_once('.')
                .map(|(_, last)| last == GLOBAL_BUCKET)
                .unwrap_or(false)
    }
}

// == Bucket Target ==
/// A purge target after name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketTarget {
    /// One concrete bucket key
    Key(String),
    /// A key pattern, expanded at purge time
    Pattern(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace() -> BucketNamespace {
        BucketNamespace::new("dev", "shop")
    }

    #[test]
    fn test_unqualified_name_belongs_to_caller() {
        let bucket = namespace().qualify("users").unwrap();
        assert_eq!(bucket.app, "shop");
        assert_eq!(bucket.to_string(), "shop.users");
        assert_eq!(namespace().bucket_key(&bucket), "BUCKET.dev.shop.users");
    }

    #[test]
    fn test_qualified_name_targets_other_application() {
        let bucket = namespace().qualify("billing.invoices").unwrap();
        assert_eq!(bucket.app, "billing");
        assert_eq!(bucket.name, "invoices");
        assert_eq!(
            namespace().bucket_key(&bucket),
            "BUCKET.dev.billing.invoices"
        );
    }

    #[test]
    fn test_reserved_and_malformed_names_rejected() {
        assert!(namespace().qualify("GLOBAL").is_err());
        assert!(namespace().qualify("billing.GLOBAL").is_err());
        assert!(namespace().qualify("billing.archive.GLOBAL").is_err());
        assert!(namespace().qualify("").is_err());
        assert!(namespace().qualify(".users").is_err());
        assert!(namespace().qualify("billing.").is_err());
    }

    #[test]
    fn test_resolve_for_set_dedupes_and_rejects_wildcards() {
        let names = vec![
            "users".to_string(),
            "shop.users".to_string(),
            "orders".to_string(),
        ];
        let resolved = namespace().resolve_for_set(&names).unwrap();
        assert_eq!(resolved.len(), 2);

        let wildcard = vec!["*".to_string()];
        assert!(matches!(
            namespace().resolve_for_set(&wildcard),
            Err(CacheError::Validation(_))
        ));
    }

    #[test]
    fn test_resolve_for_purge() {
        let names = vec![
            "users".to_string(),
            "*".to_string(),
            "billing.*".to_string(),
        ];
        let targets = namespace().resolve_for_purge(&names).unwrap();
        assert_eq!(
            targets,
            vec![
                BucketTarget::Key("BUCKET.dev.shop.users".to_string()),
                BucketTarget::Pattern("BUCKET.dev.shop.*".to_string()),
                BucketTarget::Pattern("BUCKET.dev.billing.*".to_string()),
            ]
        );
    }

    #[test]
    fn test_short_name_and_global_detection() {
        let ns = namespace();
        assert_eq!(ns.short_name("BUCKET.dev.shop.users"), Some("shop.users"));
        assert_eq!(ns.short_name("BUCKET.prod.shop.users"), None);
        assert_eq!(ns.global_key(), "BUCKET.dev.shop.GLOBAL");
        assert!(BucketNamespace::is_global_key(&ns.global_key()));
        assert!(!BucketNamespace::is_global_key("BUCKET.dev.shop.users"));
        assert!(!BucketNamespace::is_global_key("GLOBAL"));
        assert_eq!(
            ns.bucket_key_for_short("billing.invoices"),
            "BUCKET.dev.billing.invoices"
        );
    }
}
