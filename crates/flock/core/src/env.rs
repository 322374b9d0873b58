use anyhow::{anyhow, Result};

pub fn infer<K, R>(key: K) -> Result<R>
where
    K: AsRef<str>,
    R: ::core::str::FromStr,
    <R as ::core::str::FromStr>::Err: 'static + Send + Sync + ::core::fmt::Display,
{
    let key = key.as_ref();

    infer_string(key).and_then(|e| {
        e.parse()
            .map_err(|error| anyhow!("failed to parse the environment variable ({key}): {error}"))
    })
}

pub fn infer_string<K>(key: K) -> Result<String>
where
    K: AsRef<str>,
{
    let key = key.as_ref();

    ::std::env::var(key).map_err(|_| anyhow!("failed to find the environment variable: {key}"))
}

/// Like [`infer`], but a missing variable is not an error.
pub fn infer_opt<K, R>(key: K) -> Result<Option<R>>
where
    K: AsRef<str>,
    R: ::core::str::FromStr,
    <R as ::core::str::FromStr>::Err: 'static + Send + Sync + ::core::fmt::Display,
{
    let key = key.as_ref();
    match ::std::env::var_os(key) {
        Some(_) => infer(key).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variable_is_none() {
        let value: Option<u64> =
            infer_opt("FLOCK_TEST_SURELY_UNSET").expect("failed to infer an unset variable");
        assert_eq!(value, None);
    }

    #[test]
    fn malformed_variable_names_key() {
        ::std::env::set_var("FLOCK_TEST_MALFORMED", "abc");
        let error = infer::<_, u64>("FLOCK_TEST_MALFORMED").unwrap_err();
        assert!(error.to_string().contains("FLOCK_TEST_MALFORMED"));
    }
}
