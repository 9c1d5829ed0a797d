// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Argus NVR metadata store: streams, recordings, and segments.
//!
//! Media samples never pass through here; the writer streams them to
//! fragmented `.mp4` files and records only metadata rows. Every write uses
//! a short transaction on the single writer connection. Readers which must
//! not contend (the HTTP layer) should use [`Database::open_read_only`].

use crate::json::StreamConfig;
use base::time::Time;
use base::{bail, err, Error};
use rusqlite::{named_params, params, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// The current schema version; see `schema.sql`.
pub const SCHEMA_VERSION: i32 = 1;

/// A globally unique recording id (UUIDv7, so time-ordered).
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct RecordingId(pub Uuid);

impl RecordingId {
    pub fn generate() -> Self {
        RecordingId(Uuid::now_v7())
    }
}

impl std::fmt::Display for RecordingId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl rusqlite::types::ToSql for RecordingId {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(self.0.as_bytes()[..].into())
    }
}

impl rusqlite::types::FromSql for RecordingId {
    fn column_result(
        value: rusqlite::types::ValueRef,
    ) -> Result<Self, rusqlite::types::FromSqlError> {
        let b = value.as_blob()?;
        let u = Uuid::from_slice(b).map_err(|e| rusqlite::types::FromSqlError::Other(e.into()))?;
        Ok(RecordingId(u))
    }
}

/// What caused a recording to start.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trigger {
    Continuous,
    Motion,
    Objects,
    Manual,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Continuous => "continuous",
            Trigger::Motion => "motion",
            Trigger::Objects => "objects",
            Trigger::Manual => "manual",
        }
    }

    fn from_i64(v: i64) -> Result<Self, Error> {
        Ok(match v {
            0 => Trigger::Continuous,
            1 => Trigger::Motion,
            2 => Trigger::Objects,
            3 => Trigger::Manual,
            _ => bail!(DataLoss, msg("bad trigger value {v} in database")),
        })
    }

    fn to_i64(self) -> i64 {
        match self {
            Trigger::Continuous => 0,
            Trigger::Motion => 1,
            Trigger::Objects => 2,
            Trigger::Manual => 3,
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recording row, with its segments when listed via [`Database::query_recordings`].
#[derive(Clone, Debug)]
pub struct RecordingRow {
    pub id: RecordingId,
    pub stream_name: String,
    pub trigger: Trigger,
    pub start: Time,
    pub end: Option<Time>,
    pub complete: bool,
    pub segments: Vec<SegmentRow>,
}

#[derive(Clone, Debug)]
pub struct SegmentRow {
    pub segment_index: i32,
    pub path: PathBuf,
    pub first_pts: Option<i64>,
    pub last_pts: Option<i64>,
    pub start: Time,
    pub end: Option<Time>,
    pub size_bytes: i64,
    pub has_audio: bool,
    pub ended_on_keyframe: bool,
    pub incomplete: bool,
}

/// Fields recorded when a segment file is finalized.
#[derive(Clone, Debug)]
pub struct SegmentClose {
    pub first_pts: i64,
    pub last_pts: i64,
    pub end: Time,
    pub size_bytes: i64,
    pub has_audio: bool,
    pub ended_on_keyframe: bool,
}

/// Filter for [`Database::query_recordings`]. `Default` matches everything,
/// newest first, with a sane row limit.
#[derive(Clone, Debug)]
pub struct RecordingFilter {
    pub stream: Option<String>,
    pub start: Option<Time>,
    pub end: Option<Time>,
    pub trigger: Option<Trigger>,
    pub complete_only: bool,
    pub limit: usize,
}

impl Default for RecordingFilter {
    fn default() -> Self {
        RecordingFilter {
            stream: None,
            start: None,
            end: None,
            trigger: None,
            complete_only: false,
            limit: 64,
        }
    }
}

const LIST_SEGMENTS_SQL: &str = r#"
    select
      segment_index,
      path,
      first_pts,
      last_pts,
      start_time_90k,
      end_time_90k,
      size_bytes,
      has_audio,
      ended_on_keyframe,
      incomplete
    from
      recording_segment
    where
      recording_id = :recording_id
    order by
      segment_index
"#;

/// Initializes the schema on a fresh connection. Fails if already initialized.
pub fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    let tx = conn.transaction()?;
    tx.execute_batch(include_str!("schema.sql"))
        .map_err(|e| err!(Internal, msg("unable to create schema"), source(e)))?;
    tx.execute(
        "insert into meta (schema_version) values (?1)",
        params![SCHEMA_VERSION],
    )?;
    tx.commit()?;
    Ok(())
}

fn set_pragmas(conn: &rusqlite::Connection) -> Result<(), Error> {
    // WAL means the writer connection never blocks readers.
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "foreign_keys", "on")?;
    Ok(())
}

fn check_schema(conn: &rusqlite::Connection) -> Result<(), Error> {
    let ver: Option<i32> = conn
        .query_row("select schema_version from meta", [], |r| r.get(0))
        .optional()
        .map_err(|e| {
            err!(
                FailedPrecondition,
                msg("unable to read schema version; did you run `argus-nvr init`?"),
                source(e),
            )
        })?;
    match ver {
        Some(SCHEMA_VERSION) => Ok(()),
        Some(v) => bail!(
            FailedPrecondition,
            msg("expected schema version {SCHEMA_VERSION}, got {v}")
        ),
        None => bail!(FailedPrecondition, msg("database has no schema version row")),
    }
}

/// The metadata store. One writer connection behind a mutex; clone the `Arc`
/// holding it rather than this struct.
pub struct Database {
    conn: Mutex<rusqlite::Connection>,
}

impl Database {
    /// Opens an existing database read-write. The schema must already exist.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| err!(Unavailable, msg("unable to open {}", path.display()), source(e)))?;
        set_pragmas(&conn)?;
        check_schema(&conn)?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a read-only connection for query-heavy consumers.
    pub fn open_read_only(path: &Path) -> Result<Self, Error> {
        let conn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .map_err(|e| err!(Unavailable, msg("unable to open {}", path.display()), source(e)))?;
        check_schema(&conn)?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// Wraps an already-open connection; used by tests with in-memory
    /// databases and by `argus-nvr init`.
    pub fn from_conn(conn: rusqlite::Connection) -> Result<Self, Error> {
        check_schema(&conn)?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().expect("db connection lock poisoned")
    }

    /// Inserts a stream row, failing with `AlreadyExists` on a duplicate name.
    pub fn insert_stream(&self, name: &str, config: &StreamConfig) -> Result<(), Error> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "insert into stream (name, config) values (:name, :config)",
        )?;
        match stmt.execute(named_params! {":name": name, ":config": config}) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                bail!(AlreadyExists, msg("stream {name:?} already exists"))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_stream_config(&self, name: &str, config: &StreamConfig) -> Result<(), Error> {
        let conn = self.lock();
        let n = conn
            .prepare_cached("update stream set config = :config where name = :name")?
            .execute(named_params! {":name": name, ":config": config})?;
        if n == 0 {
            bail!(NotFound, msg("no stream {name:?}"));
        }
        Ok(())
    }

    pub fn delete_stream(&self, name: &str) -> Result<(), Error> {
        let conn = self.lock();
        let n = conn
            .prepare_cached("delete from stream where name = :name")?
            .execute(named_params! {":name": name})?;
        if n == 0 {
            bail!(NotFound, msg("no stream {name:?}"));
        }
        Ok(())
    }

    pub fn list_streams(&self) -> Result<Vec<(String, StreamConfig)>, Error> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached("select name, config from stream order by name")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((row.get(0)?, row.get(1)?));
        }
        Ok(out)
    }

    /// Creates a recording row in the in-progress state and returns its id.
    pub fn create_recording(
        &self,
        stream_name: &str,
        trigger: Trigger,
        start: Time,
    ) -> Result<RecordingId, Error> {
        let id = RecordingId::generate();
        let conn = self.lock();
        conn.prepare_cached(
            "insert into recording (id, stream_name, trigger, start_time_90k) \
             values (:id, :stream_name, :trigger, :start)",
        )?
        .execute(named_params! {
            ":id": id,
            ":stream_name": stream_name,
            ":trigger": trigger.to_i64(),
            ":start": start.0,
        })?;
        Ok(id)
    }

    /// Aligns a recording's start to the actual first keyframe, once known.
    pub fn set_recording_start(&self, id: RecordingId, start: Time) -> Result<(), Error> {
        let conn = self.lock();
        conn.prepare_cached("update recording set start_time_90k = :start where id = :id")?
            .execute(named_params! {":id": id, ":start": start.0})?;
        Ok(())
    }

    /// Records a newly opened segment file.
    pub fn open_segment(
        &self,
        id: RecordingId,
        segment_index: i32,
        path: &Path,
        start: Time,
    ) -> Result<(), Error> {
        let conn = self.lock();
        conn.prepare_cached(
            "insert into recording_segment (recording_id, segment_index, path, start_time_90k) \
             values (:recording_id, :segment_index, :path, :start)",
        )?
        .execute(named_params! {
            ":recording_id": id,
            ":segment_index": segment_index,
            ":path": path.to_str().ok_or_else(|| err!(
                InvalidArgument,
                msg("segment path {} is not valid UTF-8", path.display())
            ))?,
            ":start": start.0,
        })?;
        Ok(())
    }

    /// Finalizes a segment after a graceful close.
    pub fn close_segment(
        &self,
        id: RecordingId,
        segment_index: i32,
        c: &SegmentClose,
    ) -> Result<(), Error> {
        let conn = self.lock();
        conn.prepare_cached(
            "update recording_segment set first_pts = :first_pts, last_pts = :last_pts, \
             end_time_90k = :end, size_bytes = :size_bytes, has_audio = :has_audio, \
             ended_on_keyframe = :ended_on_keyframe, incomplete = 0 \
             where recording_id = :recording_id and segment_index = :segment_index",
        )?
        .execute(named_params! {
            ":recording_id": id,
            ":segment_index": segment_index,
            ":first_pts": c.first_pts,
            ":last_pts": c.last_pts,
            ":end": c.end.0,
            ":size_bytes": c.size_bytes,
            ":has_audio": c.has_audio,
            ":ended_on_keyframe": c.ended_on_keyframe,
        })?;
        Ok(())
    }

    /// Finalizes a recording. `complete` is false when the writer was killed
    /// or the recording was cut short by a storage error.
    pub fn close_recording(
        &self,
        id: RecordingId,
        end: Time,
        complete: bool,
    ) -> Result<(), Error> {
        let conn = self.lock();
        conn.prepare_cached(
            "update recording set end_time_90k = :end, complete = :complete where id = :id",
        )?
        .execute(named_params! {":id": id, ":end": end.0, ":complete": complete})?;
        Ok(())
    }

    /// Cleans up after an unclean shutdown: any recording still marked
    /// in-progress is closed as of its last segment activity, incomplete.
    /// Returns the number of recordings recovered.
    pub fn recover_interrupted(&self) -> Result<usize, Error> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let n = tx.execute(
            "update recording set complete = 0, end_time_90k = coalesce( \
               (select max(coalesce(s.end_time_90k, s.start_time_90k)) \
                  from recording_segment s where s.recording_id = recording.id), \
               start_time_90k) \
             where end_time_90k is null",
            [],
        )?;
        tx.commit()?;
        if n > 0 {
            info!("recovered {n} interrupted recordings");
        }
        Ok(n)
    }

    pub fn query_recordings(&self, filter: &RecordingFilter) -> Result<Vec<RecordingRow>, Error> {
        let conn = self.lock();
        let mut sql = String::from(
            "select id, stream_name, trigger, start_time_90k, end_time_90k, complete \
             from recording where true",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(ref stream) = filter.stream {
            sql.push_str(" and stream_name = ?");
            params.push(Box::new(stream.clone()));
        }
        if let Some(start) = filter.start {
            sql.push_str(" and start_time_90k >= ?");
            params.push(Box::new(start.0));
        }
        if let Some(end) = filter.end {
            sql.push_str(" and start_time_90k < ?");
            params.push(Box::new(end.0));
        }
        if let Some(trigger) = filter.trigger {
            sql.push_str(" and trigger = ?");
            params.push(Box::new(trigger.to_i64()));
        }
        if filter.complete_only {
            sql.push_str(" and complete = 1");
        }
        sql.push_str(" order by start_time_90k desc limit ?");
        params.push(Box::new(filter.limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(RecordingRow {
                id: row.get(0)?,
                stream_name: row.get(1)?,
                trigger: Trigger::from_i64(row.get(2)?)?,
                start: Time(row.get(3)?),
                end: row.get::<_, Option<i64>>(4)?.map(Time),
                complete: row.get(5)?,
                segments: Vec::new(),
            });
        }
        drop(rows);
        drop(stmt);

        let mut seg_stmt = conn.prepare_cached(LIST_SEGMENTS_SQL)?;
        for rec in &mut out {
            let mut rows = seg_stmt.query(named_params! {":recording_id": rec.id})?;
            while let Some(row) = rows.next()? {
                rec.segments.push(SegmentRow {
                    segment_index: row.get(0)?,
                    path: PathBuf::from(row.get::<_, String>(1)?),
                    first_pts: row.get(2)?,
                    last_pts: row.get(3)?,
                    start: Time(row.get(4)?),
                    end: row.get::<_, Option<i64>>(5)?.map(Time),
                    size_bytes: row.get(6)?,
                    has_audio: row.get(7)?,
                    ended_on_keyframe: row.get(8)?,
                    incomplete: row.get(9)?,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn stream_crud() {
        testutil::init();
        let db = testutil::new_db();
        let config = testutil::stream_config("rtsp://cam/front");
        db.insert_stream("front", &config).unwrap();
        let e = db.insert_stream("front", &config).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::AlreadyExists);
        let streams = db.list_streams().unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].0, "front");
        assert_eq!(streams[0].1, config);
        db.delete_stream("front").unwrap();
        let e = db.delete_stream("front").unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::NotFound);
    }

    #[test]
    fn recording_lifecycle() {
        testutil::init();
        let db = testutil::new_db();
        let start = Time::from_unix_secs(1_700_000_000);
        let id = db.create_recording("front", Trigger::Objects, start).unwrap();
        db.open_segment(id, 0, Path::new("front/2023/11/14/x-00000.mp4"), start)
            .unwrap();
        db.close_segment(
            id,
            0,
            &SegmentClose {
                first_pts: 0,
                last_pts: 90_000 * 30,
                end: start + base::time::Duration::from_secs(30),
                size_bytes: 123_456,
                has_audio: true,
                ended_on_keyframe: true,
            },
        )
        .unwrap();
        db.close_recording(id, start + base::time::Duration::from_secs(30), true)
            .unwrap();

        let rows = db.query_recordings(&RecordingFilter::default()).unwrap();
        assert_eq!(rows.len(), 1);
        let r = &rows[0];
        assert_eq!(r.id, id);
        assert_eq!(r.trigger, Trigger::Objects);
        assert!(r.complete);
        assert_eq!(r.segments.len(), 1);
        assert!(!r.segments[0].incomplete);
        assert!(r.segments[0].has_audio);
    }

    #[test]
    fn query_filters() {
        testutil::init();
        let db = testutil::new_db();
        let t0 = Time::from_unix_secs(1_700_000_000);
        let t1 = Time::from_unix_secs(1_700_000_100);
        let a = db.create_recording("front", Trigger::Motion, t0).unwrap();
        let b = db.create_recording("back", Trigger::Manual, t1).unwrap();
        db.close_recording(a, t0 + base::time::Duration::from_secs(10), true)
            .unwrap();

        let rows = db
            .query_recordings(&RecordingFilter {
                stream: Some("front".to_owned()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, a);

        let rows = db
            .query_recordings(&RecordingFilter {
                trigger: Some(Trigger::Manual),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, b);

        let rows = db
            .query_recordings(&RecordingFilter {
                complete_only: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, a);

        // Newest first.
        let rows = db.query_recordings(&RecordingFilter::default()).unwrap();
        assert_eq!(rows[0].id, b);
        assert_eq!(rows[1].id, a);
    }

    #[test]
    fn recover_interrupted_marks_incomplete() {
        testutil::init();
        let db = testutil::new_db();
        let t0 = Time::from_unix_secs(1_700_000_000);
        let id = db.create_recording("front", Trigger::Motion, t0).unwrap();
        db.open_segment(id, 0, Path::new("front/x-00000.mp4"), t0).unwrap();
        assert_eq!(db.recover_interrupted().unwrap(), 1);
        let rows = db.query_recordings(&RecordingFilter::default()).unwrap();
        assert!(!rows[0].complete);
        assert_eq!(rows[0].end, Some(t0));
        assert!(rows[0].segments[0].incomplete);
        // Idempotent.
        assert_eq!(db.recover_interrupted().unwrap(), 0);
    }
}
