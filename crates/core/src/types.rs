/// Internal job identifier, assigned monotonically at submission time.
pub type JobId = u64;

/// Identifier of one rendering context (a browser tab plus its session).
pub type ContextId = u64;

/// Correlation id supplied by the external caller on a request line.
pub type RequestId = u64;

/// Id the rendering engine assigns to a freshly created script environment.
pub type ExecutionContextId = i64;
