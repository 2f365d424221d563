//! Server-level tests. Module-level unit tests live next to their code.

mod mock;
