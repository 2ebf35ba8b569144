//! Meta path (spec §4.11): the virtual filesystem built from per-path
//! command logs. `push_file_to_meta`/`new_directory` stage commands in
//! the transient cache; `flush_meta` migrates them to the remote meta
//! log; `download_meta_for_path` replays committed and pending commands
//! back into a `MetaNode`.

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use vault_catalog::{PathKind, PendingCommand};
use vault_codec::{segment, Command, MetaSegment};
use vault_common::{Error, Identifier, PlainHash, Result};

use crate::engine::Engine;

/// One extent of a file's content: a block uploaded by `UploadFile`,
/// recorded as an `AddBlock` command once pushed to meta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileOrigin {
    pub hash: PlainHash,
    pub size: u64,
    pub start: u64,
}

/// A decoded meta path: either a file's block list or a folder's child
/// listing, reconstructed from its committed meta log plus any commands
/// still only in the transient cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaNode {
    File { size: u64, blocks: Vec<FileOrigin> },
    Folder { children: Vec<FolderEntry> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FolderEntry {
    Folder(String),
    File { name: String, size: u64 },
}

impl Engine {
    /// `DownloadMetaForPath(path)` (spec §4.11): `None` if neither
    /// namespace knows `path`; otherwise the path's full command set
    /// (remote meta log plus unflushed transient commands) decoded into
    /// a `MetaNode`.
    pub async fn download_meta_for_path(&self, path: &str) -> Result<Option<MetaNode>> {
        let path = Self::normalize_root(path);
        let Some(kind) = self.path_kind(&path).await? else {
            return Ok(None);
        };
        let commands = self.existing_commands(&path, kind).await?;

        Ok(Some(match kind {
            PathKind::File => {
                let mut blocks: Vec<FileOrigin> = commands
                    .into_iter()
                    .filter_map(|c| match c {
                        Command::AddBlock { hash, size, start } => {
                            Some(FileOrigin { hash: PlainHash(hash), size, start })
                        }
                        _ => None,
                    })
                    .collect();
                blocks.sort_by_key(|b| b.start);
                let size = blocks.last().map_or(0, |b| b.start + b.size);
                MetaNode::File { size, blocks }
            }
            PathKind::Folder => {
                let children = commands
                    .into_iter()
                    .filter_map(|c| match c {
                        Command::AddFolder { name } => Some(FolderEntry::Folder(name)),
                        Command::AddFile { name, size } => Some(FolderEntry::File { name, size }),
                        Command::AddBlock { .. } => None,
                    })
                    .collect();
                MetaNode::Folder { children }
            }
        }))
    }

    /// `pushFileToMeta(metaSegments?, fileSize, remotePath, ignoreFile)`
    /// (spec §4.11): stages the folder-chain and (unless `ignore_file`)
    /// file/block commands for `remote_path` into the transient cache.
    /// Validates the path, enforces namespace disjointness and WORM,
    /// and never touches the transport.
    pub async fn push_file_to_meta(
        &self,
        meta_segments: Option<Vec<FileOrigin>>,
        file_size: u64,
        remote_path: &str,
        ignore_file: bool,
    ) -> Result<()> {
        let _guard = self.meta_sem.lock().await;
        let (ancestors, file_name) = Self::split_remote_path(remote_path)?;

        for ancestor in &ancestors {
            if matches!(self.path_kind(ancestor).await?, Some(PathKind::File)) {
                return Err(Error::MetaEntryOverwrite(format!(
                    "'{ancestor}' is a file; a directory cannot be created through it"
                )));
            }
        }
        match self.path_kind(remote_path).await? {
            Some(PathKind::Folder) => {
                return Err(Error::MetaEntryOverwrite(format!(
                    "'{remote_path}' already exists as a folder"
                )));
            }
            Some(PathKind::File) if !ignore_file => {
                return Err(Error::MetaEntryOverwrite(format!(
                    "'{remote_path}' already exists"
                )));
            }
            _ => {}
        }

        let mut push_list: Vec<PendingCommand> = Vec::new();

        for i in 0..ancestors.len() {
            let parent = ancestors[i].clone();
            let is_leaf = i + 1 == ancestors.len();
            let child_name = if is_leaf {
                file_name.clone()
            } else {
                ancestors[i + 1]
                    .rsplit('/')
                    .next()
                    .expect("non-root ancestor has a final segment")
                    .to_string()
            };

            let children = self.existing_commands(&parent, PathKind::Folder).await?;
            let already_present = children.iter().any(|c| match c {
                Command::AddFolder { name } => *name == child_name,
                Command::AddFile { name, .. } => *name == child_name,
                Command::AddBlock { .. } => false,
            });

            if already_present {
                if is_leaf && !ignore_file {
                    return Err(Error::MetaEntryOverwrite(format!(
                        "'{child_name}' already exists under '{parent}'"
                    )));
                }
                continue;
            }
            if is_leaf && ignore_file {
                continue;
            }

            let index = children.len() as u32;
            let command = if is_leaf {
                Command::AddFile { name: file_name.clone(), size: file_size }
            } else {
                Command::AddFolder { name: child_name }
            };
            push_list.push(PendingCommand { path: parent, index, command });
        }

        if !ignore_file {
            let origins = meta_segments.unwrap_or_default();
            let base_index = self.current_command_count(remote_path, PathKind::File).await?;
            for (i, origin) in origins.iter().enumerate() {
                push_list.push(PendingCommand {
                    path: remote_path.to_string(),
                    index: base_index + i as u32,
                    command: Command::AddBlock {
                        hash: origin.hash.0,
                        size: origin.size,
                        start: origin.start,
                    },
                });
            }
        }

        self.catalog.add_commands_to_transient_cache(&push_list)
    }

    /// `NewDirectory(remotePath)` (spec §4.11): creates the enclosing
    /// folder chain without a terminal file, by pushing a never-written
    /// `.ignore` leaf under it.
    pub async fn new_directory(&self, remote_path: &str) -> Result<()> {
        let root = Self::normalize_root(remote_path);
        let ignore_path = format!("{root}/.ignore");
        self.push_file_to_meta(None, 0, &ignore_path, true).await
    }

    /// `FlushMeta` (spec §4.11): migrates every transient command to
    /// the remote meta log, one path at a time, each path's command
    /// list split into `SegmentSize`-bounded pieces written to
    /// successive meta slots.
    pub async fn flush_meta(&self) -> Result<()> {
        let _guard = self.meta_sem.lock().await;

        let mut by_path: HashMap<String, Vec<PendingCommand>> = HashMap::new();
        for cmd in self.catalog.commands_in_transient_cache(None)? {
            by_path.entry(cmd.path.clone()).or_default().push(cmd);
        }

        for (path, mut commands) in by_path {
            commands.sort_by_key(|c| c.index);
            let Some(first) = commands.first() else { continue };
            let kind = first.kind();
            let next_index = self.next_meta_slot(&path, kind)?;

            let segment = MetaSegment {
                commands: commands.iter().map(|c| c.command.clone()).collect(),
            };
            let pieces = segment.to_list_of_byte_arrays(self.config.segment_size)?;

            let mut consumed = 0usize;
            for (i, piece_bytes) in pieces.iter().enumerate() {
                let piece = MetaSegment::from_bytes(piece_bytes)?;
                let count = piece.commands.len();
                if count == 0 {
                    continue;
                }
                let index_smaller_than = commands[consumed + count - 1].index + 1;
                let id = self.meta_id(kind, next_index + i as u32, &path);
                self.upload_meta_segment(piece_bytes.clone(), id, &path, index_smaller_than)
                    .await?;
                consumed += count;
            }
        }
        Ok(())
    }

    /// Uploads one meta segment piece (content-keyed, single-flight
    /// like `uploadChunk`), recording its assurance and clearing the
    /// now-flushed transient commands for `path` in one transaction
    /// (spec §4.11's `_inAssuranceAdditionTransaction`).
    async fn upload_meta_segment(
        &self,
        bytes: Vec<u8>,
        id: Identifier,
        path: &str,
        index_smaller_than: u32,
    ) -> Result<()> {
        let engine = self.clone();
        let path = path.to_string();
        self.upload_dedup
            .run(id, move || async move {
                engine
                    .upload_meta_segment_inner(bytes, id, path, index_smaller_than)
                    .await
            })
            .await
    }

    async fn upload_meta_segment_inner(
        &self,
        bytes: Vec<u8>,
        id: Identifier,
        path: String,
        index_smaller_than: u32,
    ) -> Result<()> {
        if self.catalog.find_assurance_by_index_id(id)?.is_some() {
            return Ok(());
        }

        let compressed = segment::compress(&bytes)?;
        for replication in 0..self.config.replication_attempt_count {
            if self.upload_chunk_basic(&compressed, id, replication).await? {
                let hash = PlainHash(Sha256::digest(&bytes).into());
                let length = compressed.len() as u32;
                self.catalog.in_transaction(|txn| {
                    self.catalog
                        .add_new_assurance_in_txn(txn, id, replication, hash, length)?;
                    self.catalog
                        .commands_flushed_for_path_in_txn(txn, &path, index_smaller_than)
                })?;
                return Ok(());
            }
        }
        Err(Error::UploadExhausted {
            attempts: self.config.replication_attempt_count,
        })
    }

    /// Whether `path` is currently known to be a File or Folder. Direct
    /// existence (transient cache, or slot 0 of either namespace) is
    /// checked first; failing that, a path can still be a Folder purely
    /// because its parent's listing names it as a child folder — a
    /// freshly created empty directory never gets a meta log entry of
    /// its own.
    fn path_kind<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<PathKind>>> {
        Box::pin(async move {
            if let Some(kind) = self.catalog.meta_type_at_path_in_transient_cache(path)? {
                return Ok(Some(kind));
            }
            if self
                .catalog
                .find_assurance_by_index_id(self.generator.meta_file_id(0, path))?
                .is_some()
            {
                return Ok(Some(PathKind::File));
            }
            if self
                .catalog
                .find_assurance_by_index_id(self.generator.meta_folder_id(0, path))?
                .is_some()
            {
                return Ok(Some(PathKind::Folder));
            }
            if path.is_empty() {
                return Ok(None);
            }

            let (parent, name) = Self::split_parent(path);
            if !matches!(self.path_kind(&parent).await?, Some(PathKind::Folder)) {
                return Ok(None);
            }
            let parent_children = self.existing_commands(&parent, PathKind::Folder).await?;
            let is_child_folder = parent_children
                .iter()
                .any(|c| matches!(c, Command::AddFolder { name: n } if *n == name));
            Ok(is_child_folder.then_some(PathKind::Folder))
        })
    }

    /// The full, ordered command list for `path`: every committed meta
    /// segment followed by still-pending transient commands.
    async fn existing_commands(&self, path: &str, kind: PathKind) -> Result<Vec<Command>> {
        let segments = self.fetch_meta_segments(path, kind).await?;
        let mut commands: Vec<Command> = segments.into_iter().flat_map(|s| s.commands).collect();
        let mut pending = self.catalog.commands_in_transient_cache(Some(path))?;
        pending.sort_by_key(|p| p.index);
        commands.extend(pending.into_iter().map(|p| p.command));
        Ok(commands)
    }

    async fn current_command_count(&self, path: &str, kind: PathKind) -> Result<u32> {
        Ok(self.existing_commands(path, kind).await?.len() as u32)
    }

    /// Fetches every committed meta segment for `path`, slots
    /// 0,1,2,… until one is absent, with concurrency bounded by
    /// `meta_download_concurrency` (spec §4.11: "concurrency <= 10").
    async fn fetch_meta_segments(&self, path: &str, kind: PathKind) -> Result<Vec<MetaSegment>> {
        let mut ids = Vec::new();
        let mut index = 0u32;
        loop {
            let id = self.meta_id(kind, index, path);
            if self.catalog.find_assurance_by_index_id(id)?.is_none() {
                break;
            }
            ids.push(id);
            index += 1;
        }

        let concurrency = self.config.meta_download_concurrency;
        let engine = self.clone();
        stream::iter(ids.into_iter().map(move |id| {
            let engine = engine.clone();
            async move {
                let bytes = engine.download_chunk(id, true).await?;
                MetaSegment::from_bytes(&bytes)
            }
        }))
        .buffered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()
    }

    fn next_meta_slot(&self, path: &str, kind: PathKind) -> Result<u32> {
        let mut index = 0u32;
        loop {
            let id = self.meta_id(kind, index, path);
            if self.catalog.find_assurance_by_index_id(id)?.is_none() {
                return Ok(index);
            }
            index += 1;
        }
    }

    /// `""` for the root, otherwise `path` with any trailing `/`
    /// stripped, matching the convention `split_remote_path` uses for
    /// ancestor folder paths.
    fn normalize_root(path: &str) -> String {
        if path.is_empty() || path == "/" {
            String::new()
        } else {
            path.trim_end_matches('/').to_string()
        }
    }

    fn split_parent(path: &str) -> (String, String) {
        match path.rsplit_once('/') {
            Some((parent, name)) => (parent.to_string(), name.to_string()),
            None => (String::new(), path.to_string()),
        }
    }

    /// Validates `remote_path` (spec §4.11: `/`-separated, absolute,
    /// nonempty file name, canonical) and decomposes it into ancestor
    /// folder paths `["", d1, d1/d2, …]` plus the final file name.
    fn split_remote_path(remote_path: &str) -> Result<(Vec<String>, String)> {
        if !remote_path.starts_with('/') {
            return Err(Error::invalid_path(format!(
                "'{remote_path}' is not absolute"
            )));
        }
        let segments: Vec<&str> = remote_path[1..].split('/').collect();
        if segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
            return Err(Error::invalid_path(format!(
                "'{remote_path}' is not a canonical path"
            )));
        }
        let Some((file_name, dirs)) = segments.split_last() else {
            return Err(Error::invalid_path(format!(
                "'{remote_path}' has no file name"
            )));
        };
        if file_name.is_empty() {
            return Err(Error::invalid_path(format!(
                "'{remote_path}' has no file name"
            )));
        }

        let mut ancestors = vec![String::new()];
        let mut cur = String::new();
        for seg in dirs {
            cur = format!("{cur}/{seg}");
            ancestors.push(cur.clone());
        }
        Ok((ancestors, (*file_name).to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_remote_path_decomposes_ancestors_and_file_name() {
        let (ancestors, name) = Engine::split_remote_path("/a/b/c.bin").unwrap();
        assert_eq!(ancestors, vec!["".to_string(), "/a".to_string(), "/a/b".to_string()]);
        assert_eq!(name, "c.bin");
    }

    #[test]
    fn split_remote_path_handles_top_level_file() {
        let (ancestors, name) = Engine::split_remote_path("/x.bin").unwrap();
        assert_eq!(ancestors, vec!["".to_string()]);
        assert_eq!(name, "x.bin");
    }

    #[test]
    fn split_remote_path_rejects_relative_paths() {
        assert!(Engine::split_remote_path("a/b").is_err());
    }

    #[test]
    fn split_remote_path_rejects_root_alone() {
        assert!(Engine::split_remote_path("/").is_err());
    }

    #[test]
    fn split_remote_path_rejects_dot_segments() {
        assert!(Engine::split_remote_path("/a/../b").is_err());
        assert!(Engine::split_remote_path("/a/./b").is_err());
    }

    #[test]
    fn split_remote_path_rejects_double_slash() {
        assert!(Engine::split_remote_path("/a//b").is_err());
    }

    #[test]
    fn normalize_root_collapses_root_spellings() {
        assert_eq!(Engine::normalize_root("/"), "");
        assert_eq!(Engine::normalize_root(""), "");
        assert_eq!(Engine::normalize_root("/a/"), "/a");
    }
}
