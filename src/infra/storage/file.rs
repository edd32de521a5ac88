use crate::types::{CatalogError, CatalogResult};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// ドキュメント保存用のサブディレクトリ名
pub const DOCUMENTS_DIR: &str = "Documents";
/// 画像保存用のサブディレクトリ名
pub const IMAGES_DIR: &str = "Images";

/// 外部URLかどうかを判定する
/// httpで始まるパスはストレージ管理外として扱い、削除対象にしない
pub fn is_external_url(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

/// 相対パスをサニタイズする
///
/// `<>:"|?*` を除去し、スラッシュ・バックスラッシュ区切りを正規化、
/// `.` と `..` のセグメントを取り除いた相対パスを返す。
pub fn sanitize_relative_path(input: &str) -> PathBuf {
    let cleaned: String = input
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*'))
        .collect();

    let mut result = PathBuf::new();
    for segment in cleaned.split(['/', '\\']) {
        if segment.is_empty() || segment == "." || segment == ".." {
            continue;
        }
        result.push(segment);
    }
    result
}

/// 衝突しない保存先パスを決定する
/// 既存ファイルがある場合は `name_1.ext`, `name_2.ext`... と連番を付ける
fn unique_destination(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let stem = Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string());
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_string());

    let mut counter = 1usize;
    loop {
        let name = match &ext {
            Some(ext) => format!("{}_{}.{}", stem, counter, ext),
            None => format!("{}_{}", stem, counter),
        };
        let candidate = dir.join(&name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// 管理対象ファイルストレージ
///
/// 設定されたルートディレクトリ配下にドキュメント・画像ファイルを保存し、
/// データベース行からは相対パスで参照される。
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// ルートと既定のサブディレクトリを作成する
    pub fn ensure_layout(&self) -> CatalogResult<()> {
        for dir in [
            self.root.clone(),
            self.root.join(DOCUMENTS_DIR),
            self.root.join(IMAGES_DIR),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| CatalogError::storage(dir.to_string_lossy(), e))?;
        }
        Ok(())
    }

    /// 相対パスをルート配下の絶対パスへ解決する（サニタイズ込み）
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(sanitize_relative_path(relative))
    }

    /// ファイルを保存し、データベースに記録する相対パスを返す
    ///
    /// 同名ファイルが存在する場合は連番サフィックスを付けて保存する。
    /// 返すパスの区切りは常に `/`。
    pub fn save(&self, subdir: &str, original_name: &str, bytes: &[u8]) -> CatalogResult<String> {
        let dir = self.root.join(sanitize_relative_path(subdir));
        fs::create_dir_all(&dir).map_err(|e| CatalogError::storage(dir.to_string_lossy(), e))?;

        let safe_name = sanitize_relative_path(original_name);
        let filename = safe_name
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());

        let destination = unique_destination(&dir, &filename);
        fs::write(&destination, bytes)
            .map_err(|e| CatalogError::storage(destination.to_string_lossy(), e))?;

        let relative = destination
            .strip_prefix(&self.root)
            .unwrap_or(&destination)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        Ok(relative)
    }

    /// ファイルをベストエフォートで削除する
    ///
    /// 外部URLは対象外。削除失敗はwarnログのみで、呼び出し元の処理は
    /// 継続される（スペック上、主データ経路を妨げない方針）。
    pub fn remove_best_effort(&self, url_or_path: &str) {
        if is_external_url(url_or_path) {
            return;
        }
        let target = self.resolve(url_or_path);
        if !target.exists() {
            return;
        }
        if let Err(e) = fs::remove_file(&target) {
            warn!(path = %target.display(), error = %e, "ファイル削除に失敗しました（処理は継続）");
        }
    }

    /// ディレクトリツリーをストレージルート配下へ再帰的にコピーする
    /// ZIPインポートの uploads/ 展開に使用。コピーしたファイル数を返す
    pub fn copy_tree_into(&self, source_dir: &Path) -> CatalogResult<usize> {
        let mut copied = 0usize;
        copy_tree(source_dir, source_dir, &self.root, &mut copied)?;
        Ok(copied)
    }
}

fn copy_tree(
    dir: &Path,
    source_root: &Path,
    dest_root: &Path,
    copied: &mut usize,
) -> CatalogResult<usize> {
    let entries =
        fs::read_dir(dir).map_err(|e| CatalogError::storage(dir.to_string_lossy(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CatalogError::storage(dir.to_string_lossy(), e))?;
        let path = entry.path();
        if path.is_dir() {
            copy_tree(&path, source_root, dest_root, copied)?;
        } else {
            let relative = path.strip_prefix(source_root).unwrap_or(&path);
            let sanitized = sanitize_relative_path(&relative.to_string_lossy());
            let destination = dest_root.join(&sanitized);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| CatalogError::storage(parent.to_string_lossy(), e))?;
            }
            fs::copy(&path, &destination)
                .map_err(|e| CatalogError::storage(destination.to_string_lossy(), e))?;
            *copied += 1;
        }
    }
    Ok(*copied)
}

/// パスに隠しセグメント（先頭が`.`）が含まれるかを判定
pub fn has_hidden_component(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(seg) => seg.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // パス処理系テスト
    mod paths {
        use super::*;

        #[test]
        fn test_sanitize_removes_forbidden_chars() {
            let result = sanitize_relative_path("Docu<me>nts/man:ual?.pdf");
            assert_eq!(result, PathBuf::from("Documents").join("manual.pdf"));
        }

        #[test]
        fn test_sanitize_drops_parent_segments() {
            // `..` セグメントはルート外への脱出を防ぐため除去される
            let result = sanitize_relative_path("../../etc/passwd");
            assert_eq!(result, PathBuf::from("etc").join("passwd"));

            let result = sanitize_relative_path("./Documents/./a.pdf");
            assert_eq!(result, PathBuf::from("Documents").join("a.pdf"));
        }

        #[test]
        fn test_sanitize_collapses_separators() {
            let result = sanitize_relative_path("Images//profile\\\\main.png");
            assert_eq!(result, PathBuf::from("Images").join("profile").join("main.png"));
        }

        #[test]
        fn test_is_external_url() {
            assert!(is_external_url("https://example.com/manual.pdf"));
            assert!(is_external_url("http://example.com/m.pdf"));
            assert!(!is_external_url("Documents/manual.pdf"));
        }
    }

    // ファイル保存・削除系テスト
    mod storage {
        use super::*;

        #[test]
        fn test_save_and_collision_suffix() {
            let dir = tempdir().expect("一時ディレクトリの作成に失敗");
            let storage = FileStorage::new(dir.path());
            storage.ensure_layout().expect("レイアウト作成に失敗");

            let first = storage
                .save(DOCUMENTS_DIR, "manual.pdf", b"first")
                .expect("1回目の保存に失敗");
            assert_eq!(first, "Documents/manual.pdf");

            // 同名ファイルは連番サフィックスで保存される
            let second = storage
                .save(DOCUMENTS_DIR, "manual.pdf", b"second")
                .expect("2回目の保存に失敗");
            assert_eq!(second, "Documents/manual_1.pdf");

            let third = storage
                .save(DOCUMENTS_DIR, "manual.pdf", b"third")
                .expect("3回目の保存に失敗");
            assert_eq!(third, "Documents/manual_2.pdf");

            assert_eq!(fs::read(storage.resolve(&first)).unwrap(), b"first");
            assert_eq!(fs::read(storage.resolve(&second)).unwrap(), b"second");
        }

        #[test]
        fn test_remove_best_effort() {
            let dir = tempdir().expect("一時ディレクトリの作成に失敗");
            let storage = FileStorage::new(dir.path());
            storage.ensure_layout().expect("レイアウト作成に失敗");

            let rel = storage
                .save(IMAGES_DIR, "photo.png", b"data")
                .expect("保存に失敗");
            assert!(storage.resolve(&rel).exists());

            storage.remove_best_effort(&rel);
            assert!(!storage.resolve(&rel).exists());

            // 存在しないパス・外部URLでもパニックしない
            storage.remove_best_effort("Images/nothing.png");
            storage.remove_best_effort("https://example.com/photo.png");
        }

        #[test]
        fn test_copy_tree_into() {
            let source = tempdir().expect("一時ディレクトリの作成に失敗");
            let uploads = source.path().join("Documents");
            fs::create_dir_all(&uploads).unwrap();
            fs::write(uploads.join("a.pdf"), b"aaa").unwrap();
            fs::write(uploads.join("b.pdf"), b"bbb").unwrap();

            let dest = tempdir().expect("一時ディレクトリの作成に失敗");
            let storage = FileStorage::new(dest.path());

            let copied = storage
                .copy_tree_into(source.path())
                .expect("ツリーコピーに失敗");
            assert_eq!(copied, 2);
            assert!(dest.path().join("Documents/a.pdf").exists());
            assert!(dest.path().join("Documents/b.pdf").exists());
        }
    }
}
