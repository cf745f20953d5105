pub mod cache;
pub mod imports;
pub mod marker;

pub use cache::{Fragment, PromptCache, SpliceOutcome, splice};
pub use imports::{LIBRARY_TABLE, LibrarySpec, prepend_imports};
pub use marker::{Marker, emit_marker, escape_prompt, extract_markers};
