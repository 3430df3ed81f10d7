//! The precomputed IHDR CRC lookup index.
//!
//! One SQLite table maps an IHDR CRC32 to the parameters that produce it.
//! Rows are the product of the curated resolution set, the valid bit
//! depth/color type pairs, and both interlace modes. The table is filled
//! once by an init command ([`IhdrIndex::create`]); workers open a
//! read-only view ([`IhdrIndex::open`]), which keeps concurrent workers
//! from racing to populate it.
//!
//! CRC collisions are expected across 32 bits: [`IhdrIndex::lookup`] may
//! return several candidates and callers must re-verify each against the
//! stored CRC before trusting it.

use std::{path::Path, sync::Mutex, sync::PoisonError};

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::{resolutions, valid_depth_color_pairs, Error, Ihdr};

/// Rows inserted per transaction while populating.
const INSERT_BATCH: usize = 10_000;

/// A read view (or, during initialization, a write handle) over the CRC
/// lookup table.
///
/// The connection is mutex-wrapped so a shared reference can serve lookups
/// from concurrent analyzer tasks; after initialization the data is
/// read-only so serialization is the only coordination needed.
pub struct IhdrIndex {
    conn: Mutex<Connection>,
}

impl IhdrIndex {
    /// Create (or complete) the index at `path`, populating it when empty.
    pub fn create(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.populate()?;
        Ok(index)
    }

    /// Open an existing index read-only. Fails if the file does not exist.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory index, populated; meant for tests.
    pub fn in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.populate()?;
        Ok(index)
    }

    /// All parameter sets whose IHDR CRC equals `crc`.
    ///
    /// Candidates are returned in insertion order; callers re-verify each
    /// one because distinct parameters can collide on the same CRC.
    pub fn lookup(&self, crc: u32) -> Result<Vec<Ihdr>, Error> {
        let conn = self.lock();
        let mut statement = conn.prepare_cached(
            "SELECT width, height, bit_depth, color_type, interlace
             FROM ihdr WHERE crc = ? ORDER BY rowid",
        )?;
        let rows = statement.query_map([i64::from(crc)], |row| {
            Ok(Ihdr::new(
                row.get(0)?,
                row.get(1)?,
                row.get::<_, u8>(2)?,
                row.get::<_, u8>(3)?,
                row.get::<_, u8>(4)?,
            ))
        })?;
        let mut found = Vec::new();
        for row in rows {
            found.push(row?);
        }
        Ok(found)
    }

    /// Number of rows in the index.
    pub fn len(&self) -> Result<usize, Error> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM ihdr", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Whether the index holds no rows.
    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Create the schema and fill the table when it is empty.
    /// Returns the number of rows inserted (zero when already populated).
    fn populate(&self) -> Result<usize, Error> {
        let mut conn = self.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS ihdr (
                crc INTEGER NOT NULL,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                bit_depth INTEGER NOT NULL,
                color_type INTEGER NOT NULL,
                interlace INTEGER NOT NULL
            )",
            [],
        )?;

        let existing: i64 = conn.query_row("SELECT COUNT(*) FROM ihdr", [], |row| row.get(0))?;
        if existing > 0 {
            debug!(rows = existing, "ihdr index already populated");
            return Ok(0);
        }

        let sizes = resolutions();
        let pairs: Vec<_> = valid_depth_color_pairs().collect();
        let mut inserted = 0usize;

        let mut pending: Vec<Ihdr> = Vec::with_capacity(INSERT_BATCH);
        for &(width, height) in &sizes {
            for &(bit_depth, color_type) in &pairs {
                for interlace in [0u8, 1] {
                    pending.push(Ihdr::new(width, height, bit_depth, color_type, interlace));
                    if pending.len() == INSERT_BATCH {
                        inserted += flush(&mut conn, &mut pending)?;
                    }
                }
            }
        }
        inserted += flush(&mut conn, &mut pending)?;

        conn.execute("CREATE INDEX IF NOT EXISTS idx_ihdr_crc ON ihdr (crc)", [])?;
        debug!(rows = inserted, "populated ihdr index");
        Ok(inserted)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn flush(conn: &mut Connection, pending: &mut Vec<Ihdr>) -> Result<usize, Error> {
    if pending.is_empty() {
        return Ok(0);
    }
    let tx = conn.transaction()?;
    {
        let mut insert = tx.prepare_cached(
            "INSERT INTO ihdr (crc, width, height, bit_depth, color_type, interlace)
             VALUES (?, ?, ?, ?, ?, ?)",
        )?;
        for ihdr in pending.iter() {
            insert.execute((
                i64::from(ihdr.crc()),
                ihdr.width(),
                ihdr.height(),
                ihdr.bit_depth(),
                ihdr.color_type(),
                ihdr.interlace(),
            ))?;
        }
    }
    tx.commit()?;
    let count = pending.len();
    pending.clear();
    Ok(count)
}
