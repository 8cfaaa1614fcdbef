//! A precise, tag-based garbage-collected heap.
//!
//! Objects carry a small [`Header`] in front of their payload. The header's
//! [`HeapTag`] tells the collector how to find references: through a
//! per-object [`FieldMask`] for fixed layouts, every word for scanned
//! arrays, or not at all for opaque bytes.
//!
//! Roots are registered explicitly in scope-bound [`RootFrame`]s. Any
//! allocation may trigger a collection, so every reference that must survive
//! an allocating call has to be rooted first:
//!
//! ```
//! use tagheap::{RootFrame, alloc_str, heap, new_list};
//!
//! heap::init_default();
//! {
//!     let frame = RootFrame::new();
//!     let names = frame.root(new_list());
//!     names.get().append(alloc_str(b"alpha"));
//!     names.get().append(alloc_str(b"beta"));
//!     heap::collect();
//!     assert_eq!(names.get().get(1).unwrap().as_bytes(), b"beta");
//! }
//! heap::shutdown();
//! ```

pub mod buf;
pub mod dict;
pub mod error;
pub mod header;
pub mod heap;
pub mod io;
pub mod list;
pub mod roots;
pub mod shape;
pub mod slab;
pub mod str;
mod value;

pub use buf::{Buf, new_buf};
pub use dict::{Dict, DictKey, new_dict};
pub use error::{Error, Result, Violation, fatal};
pub use header::{FieldMask, HEADER_SIZE, Header, HeaderFlags, HeapTag, MAX_MASK_WORDS, WORD_SIZE};
pub use heap::{HeapSettings, HeapStats, RootProvider};
pub use io::{BufLineReader, FileLineReader, FileWriter, LineReader, Writer, new_line_reader};
pub use list::{List, list_with_capacity, new_list};
pub use roots::{FrameId, Root, RootFrame, root_in_current_frame};
pub use shape::{Managed, Shape, ShapeBuilder, ShapeId, ShapeTable};
pub use slab::Slab;
pub use str::{Str, alloc_str};
pub use value::{Gc, ObjPtr, Word};
