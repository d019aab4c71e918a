//! Empty crate root; the end-to-end scenarios live under `tests/` as
//! integration tests against [`cute_net`]'s public API.
