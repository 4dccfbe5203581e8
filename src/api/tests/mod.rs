//! API Tests
//!
//! - routes: happy paths of every endpoint, GET and POST
//! - failures: 500 paths and the failure log

mod routes;
