//! Emulation of a current directory over a protocol whose requests all carry
//! full paths.
//!
//! The cursor only moves after every step towards the target has been verified
//! as an existing directory, so a failed change leaves it where it was.

use std::io;

use tracing::debug;

use crate::filesystem::PathProbe;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Root(String),
    Parent,
    Child(String),
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryPathTracker {
    cursor: Option<String>,
    stepwise: bool,
}

impl DirectoryPathTracker {
    pub fn new(stepwise: bool) -> DirectoryPathTracker {
        DirectoryPathTracker {
            cursor: None,
            stepwise,
        }
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Forgets the cursor, the next query derives it from the home directory again.
    pub fn invalidate(&mut self) {
        self.cursor = None;
    }

    /// Resolves `path` against the cursor. Without a cursor relative paths are
    /// returned unchanged and resolved by the server against the home directory.
    pub fn resolve(&self, path: &str) -> String {
        let path = normalize_separators(path);
        if path.is_empty() || path == "." {
            return self.cursor.clone().unwrap_or_else(|| ".".into());
        }
        match &self.cursor {
            Some(cursor) if !is_absolute(&path) => join(cursor, &path),
            _ => path,
        }
    }

    /// The tracked directory, or the server's home directory when nothing has
    /// been tracked yet. The home directory is not stored as the cursor.
    pub async fn current_directory<P>(&self, probe: &P) -> io::Result<String>
    where
        P: PathProbe + ?Sized,
    {
        match &self.cursor {
            Some(cursor) => Ok(cursor.clone()),
            None => probe.canonicalize(".").await,
        }
    }

    pub async fn change_directory<P>(&mut self, probe: &P, path: &str) -> io::Result<()>
    where
        P: PathProbe + ?Sized,
    {
        let path = normalize_separators(path);
        if path.is_empty() || path == "." {
            return Ok(());
        }

        if !self.stepwise {
            let target = probe.canonicalize(&self.resolve(&path)).await?;
            verify_directory(probe, &target).await?;
            debug!(from = ?self.cursor, to = %target, "changed directory");
            self.cursor = Some(target);
            return Ok(());
        }

        let (mut current, steps) = match self.plan(&path) {
            Some(plan) => plan,
            None => (probe.canonicalize(".").await?, relative_steps(&path)),
        };
        for step in steps {
            current = match step {
                Step::Root(root) => root,
                Step::Parent => parent(&current),
                Step::Child(name) => join(&current, &name),
            };
            verify_directory(probe, &current).await?;
        }

        debug!(from = ?self.cursor, to = %current, "changed directory stepwise");
        self.cursor = Some(current);
        Ok(())
    }

    pub async fn change_to_parent<P>(&mut self, probe: &P) -> io::Result<()>
    where
        P: PathProbe + ?Sized,
    {
        let current = self.current_directory(probe).await?;
        let target = parent(&current);
        verify_directory(probe, &target).await?;
        self.cursor = Some(target);
        Ok(())
    }

    /// Start directory and steps towards `path`. `None` when the start is the
    /// home directory, which only the server knows.
    fn plan(&self, path: &str) -> Option<(String, Vec<Step>)> {
        if !is_absolute(path) {
            return self.cursor.as_ref().map(|cursor| (cursor.clone(), relative_steps(path)));
        }

        let (root, rest) = split_root(path);
        let target = lexical_segments(rest);
        let from_root = || {
            let mut steps = vec![Step::Root(root.to_string())];
            steps.extend(target.iter().cloned().map(Step::Child));
            (root.to_string(), steps)
        };

        let Some(cursor) = &self.cursor else {
            return Some(from_root());
        };
        let (cursor_root, cursor_rest) = split_root(cursor);
        if !is_absolute(cursor) || cursor_root != root {
            return Some(from_root());
        }

        let base = lexical_segments(cursor_rest);
        let common = base.iter().zip(&target).take_while(|(a, b)| a == b).count();
        if common == 0 {
            return Some(from_root());
        }
        let mut steps: Vec<Step> = std::iter::repeat(Step::Parent).take(base.len() - common).collect();
        steps.extend(target[common..].iter().cloned().map(Step::Child));
        Some((cursor.clone(), steps))
    }
}

async fn verify_directory<P>(probe: &P, path: &str) -> io::Result<()>
where
    P: PathProbe + ?Sized,
{
    let attributes = probe.metadata(path).await?;
    if attributes.is_dir() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path} is not a directory"),
        ))
    }
}

fn relative_steps(path: &str) -> Vec<Step> {
    path.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .map(|segment| match segment {
            ".." => Step::Parent,
            name => Step::Child(name.to_string()),
        })
        .collect()
}

/// Segments of an absolute path with `.` and `..` folded away.
fn lexical_segments(path: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            name => segments.push(name.to_string()),
        }
    }
    segments
}

pub(crate) fn normalize_separators(path: &str) -> String {
    path.trim().replace('\\', "/")
}

fn drive_prefix(path: &str) -> Option<&str> {
    let bytes = path.as_bytes();
    match bytes {
        [letter, b':'] if letter.is_ascii_alphabetic() => Some(&path[..2]),
        [letter, b':', b'/', ..] if letter.is_ascii_alphabetic() => Some(&path[..2]),
        _ => None,
    }
}

pub(crate) fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || drive_prefix(path).is_some()
}

/// Splits `/a/b` into (`/`, `a/b`) and `C:/a` into (`C:/`, `a`).
pub(crate) fn split_root(path: &str) -> (String, &str) {
    if let Some(drive) = drive_prefix(path) {
        let rest = path[drive.len()..].trim_start_matches('/');
        return (format!("{drive}/"), rest);
    }
    match path.strip_prefix('/') {
        Some(rest) => ("/".to_string(), rest),
        None => (String::new(), path),
    }
}

pub(crate) fn join(base: &str, name: &str) -> String {
    if base.is_empty() || base == "." {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Lexical parent that never climbs above the root; relative paths bottom out at `.`.
pub(crate) fn parent(path: &str) -> String {
    let (root, rest) = split_root(path);
    let rest = rest.trim_end_matches('/');
    match rest.rfind('/') {
        Some(index) => format!("{root}{}", &rest[..index]),
        None if !root.is_empty() => root,
        None => ".".to_string(),
    }
}

/// Directory part and file name of a path.
pub(crate) fn split_file_name(path: &str) -> (String, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), &trimmed[1..]),
        Some(index) => (trimmed[..index].to_string(), &trimmed[index + 1..]),
        None => (String::new(), trimmed),
    }
}
