/// Operation table of the variable store
pub mod variable_service;

/// Consumer-side cached session view
pub mod session_context;
