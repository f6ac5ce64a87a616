//! Predicates over archive entries deciding what lands on disk.

use thiserror::Error;

/// The parts of a tar header a filter may inspect or rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub path: String,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("error getting relative path: can't make {target:?} relative to {base:?}")]
    RelativePath { base: String, target: String },
}

/// Returns `Ok(false)` to drop an entry. Filters may rewrite the header in place.
pub type Filter = Box<dyn Fn(&mut EntryHeader) -> Result<bool, FilterError> + Send + Sync>;

/// Keep entries equal to `p` or below it. Paths are compared after trimming a
/// leading `/` and cleaning; `""` and `"/"` select everything. Entries that climb
/// out of the archive root with `..` are dropped, and a `p` that climbs out
/// makes every call fail.
pub fn only_path(p: &str) -> Filter {
    let want = clean(p.trim_start_matches('/'));
    Box::new(move |h: &mut EntryHeader| {
        let have = clean(h.path.trim_start_matches('/'));
        if escapes_root(&want) {
            return Err(FilterError::RelativePath { base: want.clone(), target: have });
        }
        if escapes_root(&have) {
            return Ok(false);
        }
        if want == "." {
            return Ok(true);
        }
        Ok(have == want || have.starts_with(&format!("{}/", want)))
    })
}

/// Rewrite ownership to `uid`/`gid` and grant the owner read, write and execute.
/// Extraction never restores archive ownership, so callers pass the ids that
/// own the destination directory.
pub fn force_ownership_rwx(uid: u64, gid: u64) -> Filter {
    Box::new(move |h: &mut EntryHeader| {
        h.uid = uid;
        h.gid = gid;
        h.mode |= 0o700;
        Ok(true)
    })
}

/// Run `filters` in order, stopping at the first drop or error.
pub fn all_filters(filters: Vec<Filter>) -> Filter {
    Box::new(move |h: &mut EntryHeader| {
        for f in &filters {
            if !f(h)? {
                return Ok(false);
            }
        }
        Ok(true)
    })
}

fn escapes_root(cleaned: &str) -> bool {
    cleaned == ".." || cleaned.starts_with("../")
}

/// Lexical `/`-separated path cleaning: drops empty and `.` segments and folds
/// `..` into its parent where one exists. The empty path cleans to `.`.
pub fn clean(p: &str) -> String {
    let rooted = p.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => match out.last().copied() {
                Some(last) if last != ".." => {
                    out.pop();
                }
                _ if rooted => {}
                _ => out.push(".."),
            },
            s => out.push(s),
        }
    }
    let joined = out.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(path: &str) -> EntryHeader {
        EntryHeader { path: path.to_string(), mode: 0, uid: 4242, gid: 4343 }
    }

    fn keep(f: &Filter, path: &str) -> bool {
        f(&mut header(path)).unwrap()
    }

    #[test]
    fn cleaning() {
        assert_eq!(clean(""), ".");
        assert_eq!(clean("a//b/./c/"), "a/b/c");
        assert_eq!(clean("a/../../b"), "../b");
        assert_eq!(clean("/../a"), "/a");
        assert_eq!(clean("a/.."), ".");
    }

    #[test]
    fn root_source_keeps_everything() {
        for src in ["", "/"] {
            let f = only_path(src);
            for p in ["file", "/file", "/nested/file", "/deeply/nested/file"] {
                assert!(keep(&f, p), "{src:?} should keep {p:?}");
            }
        }
    }

    #[test]
    fn entries_outside_source_are_dropped() {
        let f = only_path("source");
        for p in ["elsewhere", "/elsewhere", "/nested/elsewhere", "sourcefile", "/deeply/nested/elsewhere"] {
            assert!(!keep(&f, p), "should drop {p:?}");
        }
    }

    #[test]
    fn leading_slashes_are_trimmed() {
        for src in ["source", "/source"] {
            let f = only_path(src);
            for p in ["source", "/source", "source/nested/elsewhere", "/source/deeply/nested/elsewhere"] {
                assert!(keep(&f, p), "{src:?} should keep {p:?}");
            }
        }
    }

    #[test]
    fn up_level_source_is_an_error() {
        let f = only_path("../not-supported");
        let err = f(&mut header("anything")).unwrap_err();
        assert!(err.to_string().contains("error getting relative path"));
    }

    #[test]
    fn up_level_entries_are_dropped() {
        let f = only_path("fine");
        assert!(!keep(&f, "../not-supported"));
        assert!(!keep(&f, "../fine"));
        let root = only_path("");
        assert!(!keep(&root, "a/../../etc/passwd"));
    }

    #[test]
    fn ownership_is_forced() {
        let f = force_ownership_rwx(1000, 1001);
        let mut h = header("foo/bar");
        assert!(f(&mut h).unwrap());
        assert_eq!(h, EntryHeader { path: "foo/bar".into(), mode: 0o700, uid: 1000, gid: 1001 });
    }

    #[test]
    fn composed_filters_stop_at_first_drop() {
        let f = all_filters(vec![only_path("configs"), force_ownership_rwx(1, 1)]);
        let mut kept = header("configs/pkg/catalog.json");
        assert!(f(&mut kept).unwrap());
        assert_eq!(kept.uid, 1);
        let mut dropped = header("etc/os-release");
        assert!(!f(&mut dropped).unwrap());
        assert_eq!(dropped.uid, 4242);
    }
}
