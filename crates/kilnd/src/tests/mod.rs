//! Test suites for the compile server.

mod support;
