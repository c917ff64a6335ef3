use std::io;
use std::path::{Path, PathBuf};

use rocksdb::{Options, DB};

use crate::error::Result;

/// Minimal key/value surface the disk queue and disk dupefilter need.
///
/// Errors are plain I/O errors: at this level every failure is a storage
/// hiccup and the caller decides whether it is transient or fatal.
pub trait KvStore: Send {
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> io::Result<()>;
    fn delete(&self, key: &[u8]) -> io::Result<()>;
    fn flush(&self) -> io::Result<()>;

    /// Release the store and remove whatever it keeps on disk.
    fn destroy(self) -> io::Result<()>
    where
        Self: Sized;
}

pub struct RocksStore {
    db: DB,
    path: PathBuf,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, &path)?;
        Ok(Self { db, path })
    }
}

fn io_err(e: rocksdb::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl KvStore for RocksStore {
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        self.db.get(key).map_err(io_err)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
        self.db.put(key, value).map_err(io_err)
    }

    fn delete(&self, key: &[u8]) -> io::Result<()> {
        self.db.delete(key).map_err(io_err)
    }

    fn flush(&self) -> io::Result<()> {
        self.db.flush().map_err(io_err)
    }

    fn destroy(self) -> io::Result<()> {
        let path = self.path;
        drop(self.db);
        DB::destroy(&Options::default(), &path).map_err(io_err)?;
        match std::fs::remove_dir_all(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
