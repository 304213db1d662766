pub(crate) mod messages;
pub(crate) mod session_actor;

tokio::task_local! {
    /// Id of the call context whose actor is running on this task.
    pub(crate) static CURRENT_CONTEXT: u64;
}
