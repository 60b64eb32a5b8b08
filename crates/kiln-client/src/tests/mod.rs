//! Tests that exercise the client against fake and in-process servers.

mod support;
