//! 数据根目录：路径解析与基础文件操作。

use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::ErrorKind;

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 将相对路径解析到数据根目录下，拒绝越界与符号链接。
    pub async fn resolve_path_checked(
        &self,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(normalize_relative(relative)?))
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// 路径存在（文件或目录）时返回 true。
    pub async fn exists(&self, relative: &str) -> Result<bool, StorageError> {
        let target = self.resolve_path_checked(relative, true).await?;
        match fs::metadata(&target).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn size(&self, relative: &str) -> Result<u64, StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        Ok(fs::metadata(&target).await?.len())
    }

    /// 删除文件或空目录。
    pub async fn delete_path(&self, relative: &str) -> Result<(), StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            fs::remove_dir(target).await?;
        } else {
            fs::remove_file(target).await?;
        }
        Ok(())
    }

    /// 移动文件或目录，自动创建目标父目录。
    pub async fn move_path(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve_path_checked(from, false).await?;
        let target = self.resolve_path_checked(to, true).await?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(source, target).await?;
        Ok(())
    }
}

/// 规范化数据目录内的相对路径：去掉前导分隔符与 `.`，拒绝 `..`、绝对路径与空路径。
pub fn normalize_relative(relative: &str) -> Result<PathBuf, StorageError> {
    let mut normalized = PathBuf::new();
    let trimmed = relative.trim_start_matches(['/', '\\']);
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidPath);
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(StorageError::InvalidPath);
    }
    Ok(normalized)
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::{Storage, StorageError};
    use tempfile::tempdir;

    fn make_storage() -> (tempfile::TempDir, Storage) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");
        (temp, Storage::new(root))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_path_rejects_symlink() {
        use std::os::unix::fs::symlink;

        let (temp, storage) = make_storage();
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside file");
        symlink(&outside, storage.root_path().join("link")).expect("symlink");

        let result = storage.resolve_path_checked("link", false).await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }

    #[tokio::test]
    async fn resolve_path_rejects_traversal_and_empty() {
        let (_temp, storage) = make_storage();
        for path in ["../secret.txt", "a/../../b", "", "/", "./"] {
            let result = storage.resolve_path_checked(path, true).await;
            assert!(
                matches!(result, Err(StorageError::InvalidPath)),
                "path {path:?} should be rejected"
            );
        }
        let resolved = storage
            .resolve_path_checked("/nested/./file.txt", true)
            .await
            .expect("resolve nested");
        assert_eq!(resolved, storage.root_path().join("nested").join("file.txt"));
    }

    #[tokio::test]
    async fn move_creates_parents_and_delete_removes_file() {
        let (_temp, storage) = make_storage();
        std::fs::write(storage.root_path().join("a.txt"), b"hello").expect("write file");

        storage
            .move_path("a.txt", "deep/dir/b.txt")
            .await
            .expect("move file");
        assert!(!storage.exists("a.txt").await.expect("exists a"));
        assert!(storage.exists("deep/dir/b.txt").await.expect("exists b"));
        assert_eq!(storage.size("deep/dir/b.txt").await.expect("size"), 5);

        storage
            .delete_path("deep/dir/b.txt")
            .await
            .expect("delete file");
        assert!(!storage.exists("deep/dir/b.txt").await.expect("exists b"));
        assert!(matches!(
            storage.delete_path("deep/dir/b.txt").await,
            Err(StorageError::Io(_))
        ));
    }

    #[tokio::test]
    async fn delete_refuses_non_empty_directory() {
        let (_temp, storage) = make_storage();
        std::fs::create_dir_all(storage.root_path().join("dir")).expect("create dir");
        std::fs::write(storage.root_path().join("dir/file"), b"x").expect("write file");

        assert!(storage.delete_path("dir").await.is_err());
        storage.delete_path("dir/file").await.expect("delete file");
        storage.delete_path("dir").await.expect("delete empty dir");
    }
}
