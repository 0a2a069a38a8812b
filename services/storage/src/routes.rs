use crate::served::{ServeGuard, ServedFiles};
use anyhow::Context;
use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;

/// URL prefix under which tier files are served
pub const FILES_PREFIX: &str = "/files";

/// A file-serving route for one tier directory
#[derive(Debug, Clone, PartialEq)]
pub struct FileRoute {
    /// Directory the route serves from
    pub path: String,
    /// Pattern appended to `/files`, with one capture group for the file
    /// path relative to `path`
    pub pattern: String,
    pub camera_identifier: String,
    pub category: String,
    pub subcategory: String,
    /// Camera failed to initialize but its files are still served
    pub failed: bool,
}

impl FileRoute {
    /// Route serving every file under `path` with the given extension
    pub fn for_extension(
        path: &str,
        extension: &str,
        camera_identifier: &str,
        category: &str,
        subcategory: &str,
        failed: bool,
    ) -> Self {
        Self {
            path: path.to_string(),
            pattern: format!(
                "{}/(.*\\.{}$)",
                regex::escape(path),
                regex::escape(extension)
            ),
            camera_identifier: camera_identifier.to_string(),
            category: category.to_string(),
            subcategory: subcategory.to_string(),
            failed,
        }
    }
}

/// Registration surface of the file-serving layer
#[cfg_attr(test, mockall::automock)]
pub trait RouteRegistrar: Send + Sync {
    fn register(&self, route: FileRoute) -> anyhow::Result<()>;
}

/// A request resolved to a file on disk. The file stays protected from
/// moves while this is alive.
pub struct ResolvedFile {
    pub route: FileRoute,
    pub file_path: String,
    pub guard: ServeGuard,
}

/// In-process route table backed by the served-files registry
pub struct RouteTable {
    routes: RwLock<Vec<(Regex, FileRoute)>>,
    served: ServedFiles,
}

impl RouteTable {
    pub fn new(served: ServedFiles) -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            served,
        }
    }

    /// Resolve a request path such as `/files/tier0/segments/cam1/1.m4s`
    pub fn resolve(&self, request_path: &str) -> Option<ResolvedFile> {
        let routes = self.routes.read();
        for (regex, route) in routes.iter() {
            let Some(captures) = regex.captures(request_path) else {
                continue;
            };
            let Some(relative) = captures.get(1) else {
                continue;
            };

            let file_path = format!("{}/{}", route.path, relative.as_str());
            let guard = self.served.guard(&file_path);
            return Some(ResolvedFile {
                route: route.clone(),
                file_path,
                guard,
            });
        }
        None
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl RouteRegistrar for RouteTable {
    fn register(&self, route: FileRoute) -> anyhow::Result<()> {
        let full = format!("^{}{}", FILES_PREFIX, route.pattern);
        let regex = Regex::new(&full)
            .with_context(|| format!("Invalid route pattern {}", route.pattern))?;

        debug!(
            route = %full,
            camera = %route.camera_identifier,
            category = %route.category,
            subcategory = %route.subcategory,
            "Registered file route"
        );

        let mut routes = self.routes.write();
        if !routes.iter().any(|(_, existing)| existing == &route) {
            routes.push((regex, route));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_resolve_marks_file_served() {
        let served = ServedFiles::new();
        let table = RouteTable::new(served.clone());
        table
            .register(FileRoute::for_extension(
                "/tier0/segments/cam1",
                "m4s",
                "cam1",
                "recorder",
                "segments",
                false,
            ))
            .unwrap();

        let resolved = table.resolve("/files/tier0/segments/cam1/1700000000.m4s").unwrap();
        assert_eq!(resolved.file_path, "/tier0/segments/cam1/1700000000.m4s");
        assert_eq!(resolved.route.camera_identifier, "cam1");
        assert!(served.contains("/tier0/segments/cam1/1700000000.m4s"));
        assert_eq!(served.in_flight(), 1);

        drop(resolved);
        assert_eq!(served.in_flight(), 0);
    }

    #[test]
    fn test_extension_must_match() {
        let table = RouteTable::new(ServedFiles::new());
        table
            .register(FileRoute::for_extension(
                "/tier0/recordings/cam1",
                "cam1",
                "cam1",
                "recorder",
                "recordings",
                true,
            ))
            .unwrap();

        assert!(table.resolve("/files/tier0/recordings/cam1/2024/1.mp4").is_none());
        let resolved = table
            .resolve("/files/tier0/recordings/cam1/2024/1.cam1")
            .unwrap();
        assert!(resolved.route.failed);
        assert!(table.resolve("/tier0/recordings/cam1/2024/1.cam1").is_none());
    }

    #[test]
    fn test_duplicate_registration_is_ignored() {
        let table = RouteTable::new(ServedFiles::new());
        let route = FileRoute::for_extension(
            "/tier0/snapshots",
            "jpg",
            "cam1",
            "snapshots",
            "object_detector",
            false,
        );
        table.register(route.clone()).unwrap();
        table.register(route).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_resolved_file_protected_while_alive() {
        let served = ServedFiles::with_window(Duration::from_millis(30));
        let table = RouteTable::new(served.clone());
        table
            .register(FileRoute::for_extension(
                "/tier0/segments/cam1",
                "m4s",
                "cam1",
                "recorder",
                "segments",
                false,
            ))
            .unwrap();

        let resolved = table.resolve("/files/tier0/segments/cam1/1.m4s").unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert!(served.contains(&resolved.file_path));

        let path = resolved.file_path.clone();
        drop(resolved);
        std::thread::sleep(Duration::from_millis(80));
        assert!(!served.contains(&path));
    }
}
