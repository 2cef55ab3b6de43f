//! Reference store: one photo directory per group plus a registration registry.
//!
//! The directory listing is the roster. The SQLite registry only adds
//! registration metadata; where the two disagree, [`ReferenceStore::divergence`]
//! reports it and nothing is repaired automatically.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Raster formats accepted for reference photos and captured faces.
pub const SUPPORTED_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "tiff"];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS students (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    grp           TEXT NOT NULL,
    slug          TEXT NOT NULL,
    photo_path    TEXT NOT NULL,
    registered_at TEXT NOT NULL,
    UNIQUE (grp, slug)
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unknown group: {0}")]
    UnknownGroup(String),
    #[error("invalid student name: {0:?}")]
    InvalidName(String),
    #[error("unsupported photo format (expected one of jpg, png, bmp, tiff)")]
    UnsupportedImage,
    #[error("corrupt registry row: {0}")]
    CorruptRecord(String),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("registry: {0}")]
    Registry(#[from] rusqlite::Error),
}

/// A student as seen through the photo directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Student {
    pub name: String,
    pub group: String,
    pub photo_path: PathBuf,
    /// `None` when the photo has no registry record.
    pub registered_at: Option<DateTime<Utc>>,
}

/// Photos and registry records that do not line up for one group.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Divergence {
    pub photos_without_record: Vec<PathBuf>,
    pub records_without_photo: Vec<Student>,
}

impl Divergence {
    pub fn is_empty(&self) -> bool {
        self.photos_without_record.is_empty() && self.records_without_photo.is_empty()
    }
}

pub struct ReferenceStore {
    photos_dir: PathBuf,
    groups: Vec<String>,
    conn: Connection,
}

impl ReferenceStore {
    /// Open (creating if needed) the photo root and the registry database.
    pub fn open(photos_dir: &Path, registry_path: &Path, groups: Vec<String>) -> Result<Self, StoreError> {
        if let Some(parent) = registry_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(registry_path)?;
        Self::with_connection(photos_dir, conn, groups)
    }

    /// Store with a throwaway in-memory registry.
    pub fn open_in_memory(photos_dir: &Path, groups: Vec<String>) -> Result<Self, StoreError> {
        Self::with_connection(photos_dir, Connection::open_in_memory()?, groups)
    }

    fn with_connection(photos_dir: &Path, conn: Connection, groups: Vec<String>) -> Result<Self, StoreError> {
        std::fs::create_dir_all(photos_dir)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(photos = %photos_dir.display(), groups = groups.len(), "reference store opened");
        Ok(Self {
            photos_dir: photos_dir.to_path_buf(),
            groups,
            conn,
        })
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn group_dir(&self, group: &str) -> PathBuf {
        self.photos_dir.join(group)
    }

    fn check_group(&self, group: &str) -> Result<(), StoreError> {
        if self.groups.iter().any(|g| g == group) {
            Ok(())
        } else {
            Err(StoreError::UnknownGroup(group.to_string()))
        }
    }

    /// Roster for `group`, in file-name order. A missing group directory is an empty roster.
    pub fn list_students(&self, group: &str) -> Result<Vec<Student>, StoreError> {
        self.check_group(group)?;
        let photos = list_images(&self.group_dir(group))?;
        let registered = self.registered_at_by_slug(group)?;

        let students: Vec<Student> = photos
            .into_iter()
            .filter_map(|path| {
                let slug = path.file_stem()?.to_string_lossy().into_owned();
                Some(Student {
                    name: display_name(&slug),
                    group: group.to_string(),
                    registered_at: registered.get(&slug).copied(),
                    photo_path: path,
                })
            })
            .collect();

        tracing::debug!(group, count = students.len(), "listed roster");
        Ok(students)
    }

    /// Save `photo_bytes` as the reference photo for `name` and record the registration.
    ///
    /// Re-registering a name replaces its photo, whatever the previous format.
    pub fn register(&self, name: &str, group: &str, photo_bytes: &[u8]) -> Result<Student, StoreError> {
        self.check_group(group)?;
        let name = name.trim();
        let slug = slugify(name).ok_or_else(|| StoreError::InvalidName(name.to_string()))?;
        let ext = photo_extension(photo_bytes).ok_or(StoreError::UnsupportedImage)?;

        let dir = self.group_dir(group);
        std::fs::create_dir_all(&dir)?;
        for stale in photos_for_slug(&dir, &slug)? {
            std::fs::remove_file(&stale)?;
        }

        let photo_path = dir.join(format!("{slug}.{ext}"));
        std::fs::write(&photo_path, photo_bytes)?;

        let registered_at = Utc::now();
        self.conn.execute(
            "INSERT INTO students (id, name, grp, slug, photo_path, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (grp, slug) DO UPDATE SET
                 name = excluded.name,
                 photo_path = excluded.photo_path,
                 registered_at = excluded.registered_at",
            params![
                uuid::Uuid::new_v4().to_string(),
                name,
                group,
                slug,
                photo_path.to_string_lossy(),
                registered_at.to_rfc3339(),
            ],
        )?;

        tracing::info!(group, name, path = %photo_path.display(), "student registered");
        Ok(Student {
            name: name.to_string(),
            group: group.to_string(),
            photo_path,
            registered_at: Some(registered_at),
        })
    }

    /// Delete a student's photo and registry record. Either may already be gone.
    pub fn remove(&self, student: &Student) -> Result<(), StoreError> {
        self.check_group(&student.group)?;
        match std::fs::remove_file(&student.photo_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %student.photo_path.display(), "photo already missing");
            }
            Err(e) => return Err(e.into()),
        }

        let slug = student
            .photo_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .or_else(|| slugify(&student.name))
            .ok_or_else(|| StoreError::InvalidName(student.name.clone()))?;
        let removed = self.conn.execute(
            "DELETE FROM students WHERE grp = ?1 AND slug = ?2",
            params![student.group, slug],
        )?;

        tracing::info!(group = %student.group, name = %student.name, records = removed, "student removed");
        Ok(())
    }

    /// Look a student up by name; matching ignores case and space/underscore differences.
    ///
    /// The photo directory is searched first, then registry records whose
    /// photo is gone, so such records can still be removed.
    pub fn find(&self, group: &str, name: &str) -> Result<Option<Student>, StoreError> {
        let Some(wanted) = slugify(name).map(|s| s.to_lowercase()) else {
            return Ok(None);
        };
        let same = |s: &Student| slugify(&s.name).map(|x| x.to_lowercase()).as_deref() == Some(wanted.as_str());

        if let Some(student) = self.list_students(group)?.into_iter().find(|s| same(s)) {
            return Ok(Some(student));
        }
        let orphan = self.registry(Some(group))?.into_iter().find(|s| same(s));
        if let Some(record) = &orphan {
            tracing::debug!(group, name = %record.name, "found registry record without photo");
        }
        Ok(orphan)
    }

    /// Registry records, optionally restricted to one group, ordered by group then name.
    pub fn registry(&self, group: Option<&str>) -> Result<Vec<Student>, StoreError> {
        if let Some(g) = group {
            self.check_group(g)?;
        }
        let mut stmt = self.conn.prepare(
            "SELECT name, grp, photo_path, registered_at FROM students
             WHERE ?1 IS NULL OR grp = ?1
             ORDER BY grp, name",
        )?;
        let rows = stmt.query_map(params![group], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (name, group, photo_path, registered_at) = row?;
            out.push(Student {
                name,
                group,
                photo_path: PathBuf::from(photo_path),
                registered_at: Some(parse_timestamp(&registered_at)?),
            });
        }
        Ok(out)
    }

    /// Compare the photo directory of `group` against its registry records.
    pub fn divergence(&self, group: &str) -> Result<Divergence, StoreError> {
        let roster = self.list_students(group)?;
        let records = self.registry(Some(group))?;

        let photos_without_record: Vec<PathBuf> = roster
            .iter()
            .filter(|s| s.registered_at.is_none())
            .map(|s| s.photo_path.clone())
            .collect();
        let records_without_photo: Vec<Student> = records
            .into_iter()
            .filter(|r| !r.photo_path.is_file())
            .collect();

        let divergence = Divergence {
            photos_without_record,
            records_without_photo,
        };
        if !divergence.is_empty() {
            tracing::warn!(
                group,
                unregistered_photos = divergence.photos_without_record.len(),
                missing_photos = divergence.records_without_photo.len(),
                "photo directory and registry disagree"
            );
        }
        Ok(divergence)
    }

    fn registered_at_by_slug(&self, group: &str) -> Result<HashMap<String, DateTime<Utc>>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT slug, registered_at FROM students WHERE grp = ?1")?;
        let rows = stmt.query_map(params![group], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (slug, ts) = row?;
            map.insert(slug, parse_timestamp(&ts)?);
        }
        Ok(map)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRecord(format!("registered_at {raw:?}: {e}")))
}

/// True if the path has one of [`SUPPORTED_EXTENSIONS`] (case-insensitive).
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// Supported image files directly inside `dir`, sorted by file name.
/// A missing directory yields an empty list.
pub(crate) fn list_images(dir: &Path) -> Result<Vec<PathBuf>, io::Error> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "directory not found, treating as empty");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_supported_image(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn photos_for_slug(dir: &Path, slug: &str) -> Result<Vec<PathBuf>, io::Error> {
    Ok(list_images(dir)?
        .into_iter()
        .filter(|p| p.file_stem().is_some_and(|s| s == slug))
        .collect())
}

/// File stem for a student name: trimmed, inner whitespace → `_`.
fn slugify(name: &str) -> Option<String> {
    let slug = name.split_whitespace().collect::<Vec<_>>().join("_");
    let invalid = slug.is_empty()
        || slug.starts_with('.')
        || slug.contains(['/', '\\', '\0']);
    (!invalid).then_some(slug)
}

/// Display name recovered from a file stem: `_` → space, title case.
fn display_name(stem: &str) -> String {
    let mut out = String::with_capacity(stem.len());
    let mut at_word_start = true;
    for c in stem.replace('_', " ").chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}

fn photo_extension(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        image::ImageFormat::Jpeg => Some("jpg"),
        image::ImageFormat::Png => Some("png"),
        image::ImageFormat::Bmp => Some("bmp"),
        image::ImageFormat::Tiff => Some("tiff"),
        _ => None,
    }
}
