use super::{ArtifactRef, Error, ObjectStore};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use time::OffsetDateTime;

use std::path::{Component, Path, PathBuf};

/// An object store backed by a local mirror of the artifact bucket. Object
/// ids are `/`-separated paths relative to the root; an object's update
/// time is its modification time.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsObjectStore { root: root.into() }
    }

    fn path_of(&self, id: &str) -> Result<PathBuf, Error> {
        let relative = Path::new(id);
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn scan(root: &Path, prefix: &str, since: Option<OffsetDateTime>) -> Result<Vec<ArtifactRef>, Error> {
    if !root.is_dir() {
        return Err(Error::Unreachable(root.display().to_string()));
    }
    let mut found = Vec::new();
    let mut pending = vec![root.join(prefix)];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::BadResponse(format!("{}: {}", dir.display(), e))),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::BadResponse(e.to_string()))?;
            let path = entry.path();
            let metadata = entry.metadata().map_err(|e| Error::BadResponse(e.to_string()))?;
            if metadata.is_dir() {
                pending.push(path);
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let updated = OffsetDateTime::from(
                metadata
                    .modified()
                    .map_err(|e| Error::BadResponse(e.to_string()))?,
            );
            if since.is_some_and(|since| updated.unix_timestamp() < since.unix_timestamp()) {
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let id = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            found.push(ArtifactRef { id, updated });
        }
    }
    found.sort_by(|a, b| a.updated.cmp(&b.updated).then_with(|| a.id.cmp(&b.id)));
    Ok(found)
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn list_run_artifacts<'a>(
        &'a self,
        prefix: &'a str,
        since: Option<OffsetDateTime>,
    ) -> BoxStream<'a, Result<ArtifactRef, Error>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        stream::once(async move {
            tokio::task::spawn_blocking(move || scan(&root, &prefix, since))
                .await
                .map_err(|e| Error::BadResponse(e.to_string()))?
        })
        .flat_map(|listing| match listing {
            Ok(artifacts) => stream::iter(artifacts).map(Ok).left_stream(),
            Err(e) => stream::once(async move { Err(e) }).right_stream(),
        })
        .boxed()
    }

    async fn fetch_artifact(&self, id: &str) -> Result<Vec<u8>, Error> {
        let path = self.path_of(id)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(id.to_string()),
            _ => Error::BadResponse(format!("{}: {}", id, e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn lists_json_artifacts_in_update_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("logs/job-a")).unwrap();
        std::fs::write(dir.path().join("logs/job-a/1.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("logs/job-a/2.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("logs/job-a/build-log.txt"), b"").unwrap();
        std::fs::write(dir.path().join("elsewhere.json"), b"{}").unwrap();

        let store = FsObjectStore::new(dir.path());
        let listed: Vec<ArtifactRef> = store
            .list_run_artifacts("logs", None)
            .try_collect()
            .await
            .unwrap();
        let mut ids: Vec<&str> = listed.iter().map(|a| a.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["logs/job-a/1.json", "logs/job-a/2.json"]);
        assert!(listed.windows(2).all(|w| w[0].updated <= w[1].updated));

        let future = OffsetDateTime::now_utc() + time::Duration::days(1);
        let later: Vec<ArtifactRef> = store
            .list_run_artifacts("logs", Some(future))
            .try_collect()
            .await
            .unwrap();
        assert!(later.is_empty());
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert_eq!(
            store.fetch_artifact("logs/nope.json").await,
            Err(Error::NotFound("logs/nope.json".to_string()))
        );
        assert!(matches!(
            store.fetch_artifact("../etc/passwd").await,
            Err(Error::NotFound(_))
        ));
        let empty: Vec<ArtifactRef> = store
            .list_run_artifacts("missing-prefix", None)
            .try_collect()
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn missing_root_is_unreachable() {
        let store = FsObjectStore::new("/nonexistent/tally/artifacts");
        let listed: Result<Vec<ArtifactRef>, Error> =
            store.list_run_artifacts("logs", None).try_collect().await;
        assert!(matches!(listed, Err(Error::Unreachable(_))));
    }
}
