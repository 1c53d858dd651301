//! Pending uploads ordered by priority class.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Upload priority of a file, lower first: numeric summaries (npy), then metadata
/// (yaml/yml), then text, then everything else (raw stacks).
pub fn priority(path: &Path) -> u8 {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("npy") => 0,
        Some("yaml") | Some("yml") => 1,
        Some("txt") => 2,
        _ => 3,
    }
}

/// Files waiting for upload. Each item leaves the queue exactly once.
#[derive(Debug, Default, Clone)]
pub struct UploadQueue {
    items: VecDeque<PathBuf>,
}

impl UploadQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with `candidates`, sorted by priority class then path.
    pub fn rebuild(&mut self, candidates: impl IntoIterator<Item = PathBuf>) {
        let mut items: Vec<PathBuf> = candidates.into_iter().collect();
        items.sort_by(|a, b| priority(a).cmp(&priority(b)).then_with(|| a.cmp(b)));
        items.dedup();
        self.items = items.into();
    }

    /// Insert one file behind every queued file of the same or a higher priority.
    pub fn enqueue(&mut self, path: PathBuf) {
        if self.items.contains(&path) {
            return;
        }
        let class = priority(&path);
        let at = self.items.partition_point(|p| priority(p) <= class);
        self.items.insert(at, path);
    }

    /// Take the highest-priority file.
    pub fn pop_next(&mut self) -> Option<PathBuf> {
        self.items.pop_front()
    }

    /// Drop every file. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    /// Files queued.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Nothing queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Files in upload order.
    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebuild_orders_small_files_first() {
        let mut queue = UploadQueue::new();
        queue.rebuild(["a.tif", "b.npy", "c.yaml"].map(PathBuf::from));
        let order: Vec<&PathBuf> = queue.iter().collect();
        assert_eq!(order, vec![Path::new("b.npy"), Path::new("c.yaml"), Path::new("a.tif")]);
    }

    #[test]
    fn test_enqueue_keeps_classes() {
        let mut queue = UploadQueue::new();
        queue.rebuild(["x.npy", "y.tif"].map(PathBuf::from));
        queue.enqueue(PathBuf::from("movie_name.txt"));
        queue.enqueue(PathBuf::from("z.npy"));
        queue.enqueue(PathBuf::from("z.npy"));
        let order: Vec<String> = queue.iter().map(|p| p.display().to_string()).collect();
        assert_eq!(order, vec!["x.npy", "z.npy", "movie_name.txt", "y.tif"]);
    }

    #[test]
    fn test_items_leave_once() {
        let mut queue = UploadQueue::new();
        queue.rebuild(["a.czi", "b.yml"].map(PathBuf::from));
        assert_eq!(queue.pop_next(), Some(PathBuf::from("b.yml")));
        assert_eq!(queue.pop_next(), Some(PathBuf::from("a.czi")));
        assert_eq!(queue.pop_next(), None);
        queue.rebuild(["c.tif"].map(PathBuf::from));
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
    }
}
