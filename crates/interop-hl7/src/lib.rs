//! HL7 v2.x ER7 parsing/validation (C6) and MLLP wire framing (C4/C10).

pub mod flatten;
pub mod message;
pub mod mllp;
pub mod parser;
pub mod validator;

pub use flatten::flatten;
pub use message::{Delimiters, V2Component, V2Field, V2Message, V2Segment};
pub use parser::parse_message;
pub use validator::validate;
