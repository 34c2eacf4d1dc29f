mod raw {
    // The constants generated by `built` are documented at https://docs.rs/built/latest/built/index.html
    // We only read the package version, the feature list and the git state.
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// mirt crate version such as 0.4.0
pub const MIRT_PKG_VERSION: &str = raw::PKG_VERSION;

/// Comma separated features enabled for this build
pub const MIRT_FEATURES: &str = raw::FEATURES_STR;

lazy_static! {
    /// Git version such as a96e8f991c91a81df51e7975849441f52fdbcdcc, or a96e8f991c91a81df51e7975849441f52fdbcdcc-dirty,
    /// or unknown-git-version if mirt is not built from a git repo.
    pub static ref MIRT_GIT_VERSION: &'static str = &MIRT_GIT_VERSION_STRING;

    static ref MIRT_GIT_VERSION_STRING: String = match (raw::GIT_COMMIT_HASH, raw::GIT_DIRTY) {
        (Some(hash), dirty) => format!("{}{}", hash, if dirty == Some(true) { "-dirty" } else { "" }),
        (None, _) => "unknown-git-version".to_string(),
    };

    /// Full build string, logged when a runtime starts.
    pub static ref MIRT_FULL_BUILD_INFO: String = format!(
        "mirt {} ({}, [{}])",
        MIRT_PKG_VERSION,
        *MIRT_GIT_VERSION,
        MIRT_FEATURES
    );
}
