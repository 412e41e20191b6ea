// Copyright 2023 Strixpyrr
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The three error kinds a join can surface to its caller: bad configuration,
//! transient IO failure, and structural bugs in the engine itself.

use std::io;
use thiserror::Error;

pub type Result<T = ()> = std::result::Result<T, JoinError>;

/// An error surfaced by a join instance.
///
/// `Argument` errors are caught at construction, before any segment changes
/// hands. `Io` errors are transient failures of the collaborating IO manager;
/// they are not retried here and are meant to abort the enclosing task. `Structural`
/// errors indicate the engine itself reached an impossible state -- a bug, not an
/// environmental failure -- and carry diagnostic context for whoever triages it.
#[derive(Debug, Error)]
pub enum JoinError {
	#[error("invalid join configuration: {field} {reason}")]
	Argument {
		field: &'static str,
		reason: String,
	},

	#[error("join IO failure during {operation}")]
	Io {
		operation: &'static str,
		#[source]
		source: io::Error,
	},

	#[error("structural join error: {context}")]
	Structural { context: String },
}

impl JoinError {
	pub fn argument(field: &'static str, reason: impl Into<String>) -> Self {
		Self::Argument { field, reason: reason.into() }
	}

	pub fn io(operation: &'static str, source: io::Error) -> Self {
		Self::Io { operation, source }
	}

	/// A record did not fit in a freshly-cleared segment -- it exceeds the
	/// segment size and can never be written, in memory or spilled.
	pub fn record_too_large(record_len: usize, segment_size: usize) -> Self {
		Self::io(
			"writing a record",
			io::Error::new(
				io::ErrorKind::InvalidInput,
				format!("record of {record_len} bytes exceeds segment size {segment_size}"),
			),
		)
	}

	pub fn structural(context: impl Into<String>) -> Self {
		let err = Self::Structural { context: context.into() };
		log::error!("{err}");
		err
	}
}
