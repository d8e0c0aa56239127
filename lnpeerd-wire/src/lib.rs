// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Lightning wire-message codec driven by a declarative schema.
//!
//! Messages are 2-byte big-endian type codes followed by a payload whose
//! layout is described by an ordered schema document: every field carries a
//! `position` and `length` expression over previously decoded fields. The
//! schema is data; this crate interprets it at runtime instead of generating
//! per-message structs.

mod codec;
mod error;
mod expr;
mod schema;

pub use codec::{display_id, FieldValue, Message, MessageFields};
pub use error::{WireError, WireErrorCode};
pub use schema::WireSchema;
