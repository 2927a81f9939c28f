//! Mapping



#[cfg(unix)]
mod unix;

#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;

#[cfg(windows)]
use windows as os;



use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::{access::View, Error, Result};



/// The operating system resources behind one mapped region.
///
/// Exactly one implementation is compiled for each target. Dropping a backend releases whatever it
/// holds: the view is unmapped first, then descriptors and handles are closed, then a shared name
/// is unlinked.
pub(crate) trait Backend: Sized {
    /// Maps the whole of the file at `path`, at its current length.
    fn map_file(path: &Path, writable: bool) -> Result<Self>;
    /// Maps `size` bytes of zeroed memory not backed by any file.
    fn map_anonymous(size: usize) -> Result<Self>;
    /// Creates the named shared memory object, or attaches to it if it already exists.
    fn create_shared(name: &str, size: usize) -> Result<Self>;
    /// Attaches to an existing named shared memory object.
    fn open_shared(name: &str) -> Result<Self>;

    fn view(&self) -> View;
    /// The name that is unlinked on release, after any normalization.
    fn shared_name(&self) -> Option<&str>;
    /// Writes dirty pages back to the backing store, if there is one.
    fn flush(&self) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    File,
    Anonymous,
    Shared,
}

/// A handle to one memory mapped region.
///
/// A handle is either valid, with a non-null view of [`len`](Self::len) bytes, or failed, with a
/// null view and an [`error`](Self::error) message. Reads and writes are clamped to the region, so
/// out of range accesses are silent no-ops rather than errors; check `len` first when that
/// distinction matters.
pub struct Mapping {
    view: View,
    raw: Option<os::Mapping>,
    kind: Kind,
    writable: bool,
    error_message: Option<String>,
}

impl Mapping {
    /// Maps the file at `path`, read-only unless `writable` is set.
    ///
    /// The mapping covers the file's length at the time of the call and does not follow later
    /// changes to it.
    pub fn from_file(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let path = path.as_ref();
        debug!("Mapping file {}", path.display());
        Self::settle(Kind::File, writable, os::Mapping::map_file(path, writable))
    }

    /// Maps `size` bytes of zero-initialized memory private to this process.
    pub fn anonymous(size: usize) -> Result<Self> {
        Self::settle(Kind::Anonymous, true, os::Mapping::map_anonymous(size))
    }

    /// Maps the named shared memory object, creating it with `size` bytes if it doesn't exist.
    ///
    /// When the object already exists the mapping attaches to it and takes the size the operating
    /// system reports, which may differ from `size`.
    pub fn create_shared(name: &str, size: usize) -> Result<Self> {
        Self::settle(Kind::Shared, true, os::Mapping::create_shared(name, size))
    }

    /// Maps an existing named shared memory object, taking its size from the operating system.
    pub fn open_shared(name: &str) -> Result<Self> {
        Self::settle(Kind::Shared, true, os::Mapping::open_shared(name))
    }

    /// Turns the outcome of a backend call into a handle.
    ///
    /// Only allocation failures escape as `Err`. Everything else becomes a failed handle that
    /// carries the error text.
    fn settle(kind: Kind, writable: bool, acquired: Result<os::Mapping>) -> Result<Self> {
        match acquired {
            Ok(raw) => {
                let view = raw.view();
                debug!("Created {:?} mapping of {} bytes", kind, view.len());
                Ok(Self {
                    view,
                    raw: Some(raw),
                    kind,
                    writable: view.is_writable(),
                    error_message: None,
                })
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                let message = e.capture()?;
                debug!("Failed to create {:?} mapping: {}", kind, message);
                Ok(Self {
                    view: View::EMPTY,
                    raw: None,
                    kind,
                    writable,
                    error_message: Some(message),
                })
            }
        }
    }

    /// Converts a failed handle into an error, so it can be propagated with `?`.
    pub fn ok(mut self) -> Result<Self> {
        if self.is_valid() {
            return Ok(self);
        }
        let message = self.error_message.take().unwrap_or_default();
        Err(Error::Failed(message))
    }

    /// The start of the mapped region, or null if the mapping failed.
    ///
    /// The pointer stays valid until the handle is closed or dropped.
    pub fn as_ptr(&self) -> *mut u8 {
        self.view.addr()
    }

    /// The length of the mapped region in bytes, or 0 if the mapping failed.
    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.len() == 0
    }

    pub fn is_valid(&self) -> bool {
        !self.view.is_null()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns `true` for mappings of named shared memory objects.
    pub fn is_shared(&self) -> bool {
        self.kind == Kind::Shared
    }

    /// The shared memory name as passed to the operating system. On Unix this is the name that gets
    /// unlinked when the mapping is closed.
    pub fn shared_name(&self) -> Option<&str> {
        self.raw.as_ref().and_then(|raw| raw.shared_name())
    }

    /// The message left by the most recent failed operation on this handle.
    pub fn error(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Copies bytes starting at `offset` into `buf`, returning how many were copied.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.view.read(offset, buf)
    }

    /// Copies `buf` into the region starting at `offset`, returning how many bytes were copied.
    ///
    /// Read-only mappings copy nothing.
    pub fn write(&mut self, offset: usize, buf: &[u8]) -> usize {
        self.view.write(offset, buf)
    }

    pub fn read_byte(&self, offset: usize) -> u8 {
        self.view.read_byte(offset)
    }

    pub fn write_byte(&mut self, offset: usize, value: u8) {
        self.view.write_byte(offset, value)
    }

    /// Reads a native-endian `i32` at any offset. Returns 0 unless all four bytes are mapped.
    pub fn read_i32(&self, offset: usize) -> i32 {
        self.view.read_i32(offset)
    }

    /// Writes a native-endian `i32` at any offset, if all four bytes are mapped.
    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.view.write_i32(offset, value)
    }

    /// Asks the operating system to write modified pages back to the backing file.
    ///
    /// Mappings without a backing file succeed trivially. On failure the reason replaces this
    /// handle's error message.
    pub fn flush(&mut self) -> bool {
        let Some(raw) = self.raw.as_ref() else {
            return false;
        };

        match raw.flush() {
            Ok(()) => {
                self.error_message = None;
                true
            }
            Err(e) => {
                self.record_failure(e.capture());
                false
            }
        }
    }

    /// Replaces the error message with `captured`, or clears it if the text couldn't be kept.
    fn record_failure(&mut self, captured: Result<String>) {
        match captured {
            Ok(message) => {
                debug!("{:?} mapping operation failed: {}", self.kind, message);
                self.error_message = Some(message);
            }
            Err(e) => {
                warn!("Dropping {:?} mapping error message: {}", self.kind, e);
                self.error_message = None;
            }
        }
    }

    /// Unmaps the region and releases every resource behind it.
    ///
    /// On Unix, shared memory names are unlinked here; Windows removes a named object once its last
    /// handle is closed. Dropping a handle does the same thing.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.view = View::EMPTY;
        if let Some(raw) = self.raw.take() {
            debug!("Closing {:?} mapping", self.kind);
            drop(raw);
        }
    }
}

// SAFETY: A handle owns its region exclusively and never shares its view with another handle.
// Write-class accessors take `&mut self`, so moving the handle to another thread can't race with
// writes made through it.
unsafe impl Send for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("kind", &self.kind)
            .field("addr", &self.view.addr())
            .field("len", &self.view.len())
            .field("writable", &self.writable)
            .field("shared_name", &self.shared_name())
            .field("error", &self.error_message)
            .finish()
    }
}



#[derive(Clone, Debug)]
enum Source {
    Anonymous,
    File(PathBuf),
    Shared(String),
}

/// Describes a mapping to create or open.
///
/// ```no_run
/// let map = simmap::MapCfg::shared("scratch").size(4096).create()?.ok()?;
/// # Ok::<(), simmap::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct MapCfg {
    source: Source,
    size: usize,
    writable: bool,
}

impl MapCfg {
    /// An anonymous, writable mapping. Set its length with [`size`](Self::size).
    pub fn new() -> Self {
        Self {
            source: Source::Anonymous,
            size: 0,
            writable: true,
        }
    }

    /// A read-only mapping of the file at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::File(path.into()),
            size: 0,
            writable: false,
        }
    }

    /// A mapping of the named shared memory object.
    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            source: Source::Shared(name.into()),
            size: 0,
            writable: true,
        }
    }

    /// The length to map. File mappings always use the file's length instead.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Whether a file mapping is writable. Anonymous and shared mappings always are.
    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Creates the mapping, attaching to an existing shared memory object of the same name.
    pub fn create(self) -> Result<Mapping> {
        match self.source {
            Source::Anonymous => Mapping::anonymous(self.size),
            Source::File(path) => Mapping::from_file(path, self.writable),
            Source::Shared(name) => Mapping::create_shared(&name, self.size),
        }
    }

    /// Like [`create`](Self::create), except shared memory must already exist.
    pub fn open(self) -> Result<Mapping> {
        match self.source {
            Source::Shared(name) => Mapping::open_shared(&name),
            _ => self.create(),
        }
    }
}

impl Default for MapCfg {
    fn default() -> Self {
        Self::new()
    }
}



#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("simmap_{}_{}", tag, std::process::id())
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn mapping_is_send() {
        assert_send::<Mapping>();

        let mut map = Mapping::anonymous(16).unwrap();
        map.write_i32(0, 7);
        let read = std::thread::spawn(move || map.read_i32(0)).join().unwrap();
        assert_eq!(read, 7);
    }

    #[test]
    fn lost_error_text_leaves_no_message() {
        let mut map = Mapping::anonymous(16).unwrap();

        map.record_failure(Ok("msync: Input/output error".to_string()));
        assert_eq!(map.error(), Some("msync: Input/output error"));

        let mut v: Vec<u8> = Vec::new();
        let alloc = Error::from(v.try_reserve(usize::MAX).unwrap_err());
        map.record_failure(Err(alloc));
        assert_eq!(map.error(), None);
        assert!(map.is_valid());
    }

    #[test]
    fn anonymous_end_to_end() {
        let mut map = Mapping::anonymous(1024).unwrap();
        assert!(map.is_valid());
        assert!(map.is_writable());
        assert!(!map.is_shared());
        assert_eq!(map.len(), 1024);
        assert_eq!(map.error(), None);

        let mut contents = vec![0xffu8; 1024];
        assert_eq!(map.read(0, &mut contents), 1024);
        assert!(contents.iter().all(|&b| b == 0));

        map.write_byte(1023, 0xff);
        assert_eq!(map.read_byte(1023), 0xff);
        assert_eq!(map.read_byte(1024), 0);

        map.write_i32(1021, 0x0101_0101);
        assert_eq!(map.read_byte(1021), 0);
        assert_eq!(map.read_byte(1022), 0);
        assert_eq!(map.read_byte(1023), 0xff);

        assert!(map.flush());
        map.close();
    }

    #[test]
    fn anonymous_word_round_trip() {
        let mut map = Mapping::anonymous(64).unwrap();
        for offset in [0, 1, 2, 3, 30, 60] {
            map.write_i32(offset, -123_456 - offset as i32);
            assert_eq!(map.read_i32(offset), -123_456 - offset as i32);
        }
        assert_eq!(map.read_i32(61), 0);
    }

    #[test]
    fn zero_length_anonymous_fails() {
        let map = Mapping::anonymous(0).unwrap();
        assert!(!map.is_valid());
        assert!(map.as_ptr().is_null());
        assert_eq!(map.len(), 0);
        assert!(map.error().is_some());
        assert!(matches!(map.ok(), Err(Error::Failed(_))));
    }

    #[test]
    fn file_mapping_reads_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        fs::write(&path, b"hello, mapped world").unwrap();

        let mut map = Mapping::from_file(&path, false).unwrap();
        assert!(map.is_valid());
        assert!(!map.is_writable());
        assert_eq!(map.len(), 19);

        let mut buf = [0u8; 32];
        assert_eq!(map.read(7, &mut buf), 12);
        assert_eq!(&buf[..12], b"mapped world");
        assert_eq!(map.read(19, &mut buf), 0);

        assert_eq!(map.write(0, b"HELLO"), 0);
        map.write_byte(0, b'H');
        map.write_i32(0, 0);
        assert_eq!(map.read_byte(0), b'h');
    }

    #[test]
    fn file_mapping_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zeros.bin");
        fs::write(&path, [0u8; 16]).unwrap();

        {
            let mut map = Mapping::from_file(&path, true).unwrap();
            assert!(map.is_writable());
            assert_eq!(map.write(12, b"abcdefgh"), 4);
            assert!(map.flush());
            assert_eq!(map.error(), None);
        }

        let contents = fs::read(&path).unwrap();
        assert_eq!(&contents[12..], b"abcd");
    }

    #[test]
    fn missing_file_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = Mapping::from_file(dir.path().join("missing.bin"), true).unwrap();

        assert!(!map.is_valid());
        assert!(map.is_writable());
        assert_eq!(map.len(), 0);
        assert!(map.error().is_some());
        assert_eq!(map.write(0, b"x"), 0);
        assert!(!map.flush());
        map.close();
    }

    #[test]
    fn empty_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        fs::write(&path, b"").unwrap();

        let map = Mapping::from_file(&path, false).unwrap();
        assert!(!map.is_valid());
        assert_eq!(map.error(), Some(Error::MapSizeZero.to_string().as_str()));
    }

    #[test]
    fn shared_create_then_open() {
        let name = unique_name("pair");
        let mut creator = Mapping::create_shared(&name, 4096).unwrap().ok().unwrap();
        assert!(creator.is_shared());
        assert_eq!(creator.len(), 4096);

        creator.write(100, b"pattern");
        creator.write_i32(200, 0x5eed);

        let opener = Mapping::open_shared(&name).unwrap().ok().unwrap();
        assert!(opener.is_shared());
        #[cfg(unix)]
        assert_eq!(opener.len(), creator.len());
        creator.close();

        let mut buf = [0u8; 7];
        assert_eq!(opener.read(100, &mut buf), 7);
        assert_eq!(&buf, b"pattern");
        assert_eq!(opener.read_i32(200), 0x5eed);
    }

    #[test]
    fn shared_create_attaches_to_existing() {
        let name = unique_name("attach");
        let mut first = Mapping::create_shared(&name, 8192).unwrap();
        first.write_byte(5000, 42);

        let second = Mapping::create_shared(&name, 16).unwrap();
        assert!(second.is_valid());
        assert!(second.len() >= 8192);
        assert_eq!(second.read_byte(5000), 42);
    }

    #[test]
    fn open_missing_shared_fails() {
        let map = Mapping::open_shared(&unique_name("absent")).unwrap();
        assert!(!map.is_valid());
        assert!(map.is_shared());
        assert!(map.error().is_some());
        assert_eq!(map.shared_name(), None);
    }

    #[test]
    fn cfg_dispatches_to_sources() {
        let anon = MapCfg::new().size(256).create().unwrap();
        assert!(anon.is_valid());
        assert_eq!(anon.len(), 256);

        let name = unique_name("cfg");
        let _owner = MapCfg::shared(name.as_str()).size(512).create().unwrap().ok().unwrap();
        let attached = MapCfg::shared(name).open().unwrap();
        assert!(attached.is_valid());
        assert!(attached.is_shared());

        let dir = tempfile::tempdir().unwrap();
        let missing = MapCfg::file(dir.path().join("nope")).writable(true).open().unwrap();
        assert!(!missing.is_valid());
        assert!(missing.is_writable());
    }
}
