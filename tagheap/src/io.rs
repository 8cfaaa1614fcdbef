//! Line-oriented input and string output over heap strings.

use std::{
    cell::Cell,
    fs::File,
    io::{self, BufRead, BufReader, IsTerminal},
    mem::offset_of,
    path::Path,
};

use crate::{Buf, Gc, Managed, Result, RootFrame, Shape, Str, Violation, alloc_str, heap};

pub trait Writer {
    fn write(&mut self, s: Gc<Str>) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn is_a_terminal(&self) -> bool;
}

pub trait LineReader {
    /// Next line including its trailing newline, `None` at end of input.
    fn read_line(&mut self) -> Result<Option<Gc<Str>>>;

    fn is_a_terminal(&self) -> bool {
        false
    }

    /// Underlying descriptor, `None` when there is none.
    fn file_descriptor(&self) -> Option<i32> {
        None
    }
}

/// In-memory writer. Its contents are taken with `freeze`, after which
/// further writes fail.
impl Writer for Gc<Buf> {
    fn write(&mut self, s: Gc<Str>) -> Result<()> {
        let frame = RootFrame::new();
        frame.keep(s);
        self.extend(s.as_bytes())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_a_terminal(&self) -> bool {
        false
    }
}

/// Writer over any byte sink.
pub struct FileWriter<W: io::Write> {
    inner: W,
    terminal: bool,
}

impl FileWriter<io::Stdout> {
    pub fn stdout() -> Self {
        let inner = io::stdout();
        Self {
            terminal: inner.is_terminal(),
            inner,
        }
    }
}

impl FileWriter<io::Stderr> {
    pub fn stderr() -> Self {
        let inner = io::stderr();
        Self {
            terminal: inner.is_terminal(),
            inner,
        }
    }
}

impl<W: io::Write> FileWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            terminal: false,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: io::Write> Writer for FileWriter<W> {
    fn write(&mut self, s: Gc<Str>) -> Result<()> {
        self.inner.write_all(s.as_bytes())?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    fn is_a_terminal(&self) -> bool {
        self.terminal
    }
}

/// Reads lines out of a heap string.
#[repr(C)]
pub struct BufLineReader {
    source: Cell<Gc<Str>>,
    pos: Cell<usize>,
}

impl Managed for BufLineReader {
    fn shape() -> Result<Shape, Violation> {
        Shape::fixed::<Self>("BufLineReader")
            .pointer(offset_of!(Self, source))
            .build()
    }
}

pub fn new_line_reader(source: Gc<Str>) -> Gc<BufLineReader> {
    heap::alloc(BufLineReader {
        source: Cell::new(source),
        pos: Cell::new(0),
    })
}

impl LineReader for Gc<BufLineReader> {
    fn read_line(&mut self) -> Result<Option<Gc<Str>>> {
        let source = self.source.get();
        let bytes = source.as_bytes();
        let pos = self.pos.get();
        if pos >= bytes.len() {
            return Ok(None);
        }
        let end = bytes[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(bytes.len(), |i| pos + i + 1);

        let frame = RootFrame::new();
        frame.keep(*self);
        let line = alloc_str(&bytes[pos..end]);
        self.pos.set(end);
        Ok(Some(line))
    }
}

/// Reads lines from a buffered byte source.
pub struct FileLineReader<R: BufRead> {
    inner: R,
    terminal: bool,
    fd: Option<i32>,
    line: Vec<u8>,
}

#[cfg(unix)]
fn raw_fd(source: &impl std::os::fd::AsRawFd) -> Option<i32> {
    Some(source.as_raw_fd())
}

#[cfg(not(unix))]
fn raw_fd<T>(_source: &T) -> Option<i32> {
    None
}

impl FileLineReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            terminal: file.is_terminal(),
            fd: raw_fd(&file),
            inner: BufReader::new(file),
            line: Vec::new(),
        })
    }
}

impl FileLineReader<io::StdinLock<'static>> {
    pub fn stdin() -> Self {
        let stdin = io::stdin();
        Self {
            terminal: stdin.is_terminal(),
            fd: raw_fd(&stdin),
            inner: stdin.lock(),
            line: Vec::new(),
        }
    }
}

impl<R: BufRead> FileLineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            terminal: false,
            fd: None,
            line: Vec::new(),
        }
    }
}

impl<R: BufRead> LineReader for FileLineReader<R> {
    fn read_line(&mut self) -> Result<Option<Gc<Str>>> {
        self.line.clear();
        if self.inner.read_until(b'\n', &mut self.line)? == 0 {
            return Ok(None);
        }
        Ok(Some(alloc_str(&self.line)))
    }

    fn is_a_terminal(&self) -> bool {
        self.terminal
    }

    fn file_descriptor(&self) -> Option<i32> {
        self.fd
    }
}
