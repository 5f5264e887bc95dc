use std::{
    fmt::Debug,
    fs, io,
    path::{Path, PathBuf},
};

use tracing::debug;

/// Maps a locator string to the bytes it designates.
///
/// Used for the `*_uri` configuration options (private keys, certificates and
/// known-hosts data). Implementations are expected to be cheap to call more than once.
pub trait ResourceResolver: Debug + Send + Sync {
    fn resolve(&self, locator: &str) -> io::Result<Vec<u8>>;
}

/// Understands `file:` and `classpath:` locators and bare filesystem paths.
///
/// `classpath:` locators are searched, in order, in the configured search roots.
#[derive(Debug, Clone, Default)]
pub struct DefaultResourceResolver {
    search_roots: Vec<PathBuf>,
}

impl DefaultResourceResolver {
    pub fn new() -> DefaultResourceResolver {
        DefaultResourceResolver::default()
    }

    pub fn with_search_root(mut self, root: impl Into<PathBuf>) -> DefaultResourceResolver {
        self.search_roots.push(root.into());
        self
    }

    fn resolve_classpath(&self, name: &str) -> io::Result<Vec<u8>> {
        let name = name.trim_start_matches('/');
        for root in &self.search_roots {
            let candidate = root.join(name);
            if candidate.is_file() {
                debug!(locator = name, path = %candidate.display(), "resolved classpath resource");
                return fs::read(candidate);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("classpath resource {name} not found in {} search root(s)", self.search_roots.len()),
        ))
    }
}

impl ResourceResolver for DefaultResourceResolver {
    fn resolve(&self, locator: &str) -> io::Result<Vec<u8>> {
        if let Some(rest) = locator.strip_prefix("classpath:") {
            return self.resolve_classpath(rest);
        }
        if let Some(rest) = locator.strip_prefix("file:") {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            return fs::read(Path::new(path));
        }
        match locator.split_once(':') {
            // a single letter before the colon is a windows drive, not a scheme
            Some((scheme, _)) if scheme.len() > 1 && scheme.chars().all(|c| c.is_ascii_alphanumeric()) => {
                Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unsupported resource scheme {scheme}: in {locator}"),
                ))
            }
            _ => fs::read(Path::new(locator)),
        }
    }
}
