// Shader hot-reload
//
// Watches the directories holding the SPIR-V binaries. Editors and glslc
// often replace files instead of writing in place, so the parent directory
// is watched and events are filtered by file name.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, TryRecvError};

pub struct ShaderWatcher {
    files: Vec<PathBuf>,
    events: Receiver<notify::Result<Event>>,
    // Dropping the watcher stops the notifications
    _watcher: RecommendedWatcher,
}

impl ShaderWatcher {
    pub fn new(files: &[&Path]) -> Result<Self> {
        let files: Vec<PathBuf> = files.iter().map(|path| absolute(path)).collect();

        let (sender, events) = channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let _ = sender.send(event);
        })
        .context("Failed to create file watcher")?;

        let directories: BTreeSet<&Path> = files.iter().filter_map(|file| file.parent()).collect();
        for directory in directories {
            watcher
                .watch(directory, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch {:?}", directory))?;
            log::info!("Watching {:?} for shader changes", directory);
        }

        Ok(Self {
            files,
            events,
            _watcher: watcher,
        })
    }

    /// Drain pending events; true if any watched shader changed since the
    /// last call
    pub fn poll_changed(&self) -> bool {
        let mut changed = false;
        loop {
            match self.events.try_recv() {
                Ok(Ok(event)) => {
                    if is_relevant(&event, &self.files) {
                        log::debug!("Shader change: {:?}", event.paths);
                        changed = true;
                    }
                }
                Ok(Err(e)) => log::warn!("File watcher error: {}", e),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        changed
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}

/// A create or modify event touching one of `files`
pub fn is_relevant(event: &Event, files: &[PathBuf]) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|path| {
            files.iter().any(|file| {
                path == file || (path.file_name().is_some() && path.file_name() == file.file_name())
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};

    fn files() -> Vec<PathBuf> {
        vec![
            PathBuf::from("/game/shaders/simple_shader.vert.spv"),
            PathBuf::from("/game/shaders/simple_shader.frag.spv"),
        ]
    }

    #[test]
    fn modify_of_watched_file_is_relevant() {
        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/game/shaders/simple_shader.frag.spv"));
        assert!(is_relevant(&event, &files()));
    }

    #[test]
    fn create_from_atomic_replace_is_relevant() {
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/game/shaders/./simple_shader.vert.spv"));
        assert!(is_relevant(&event, &files()));
    }

    #[test]
    fn other_files_and_removals_are_ignored() {
        let other = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/game/shaders/simple_shader.vert"));
        assert!(!is_relevant(&other, &files()));

        let removed = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/game/shaders/simple_shader.vert.spv"));
        assert!(!is_relevant(&removed, &files()));
    }
}
