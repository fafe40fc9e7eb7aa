mod unix_process_manager;

pub use unix_process_manager::{UnixProcessHandle, UnixProcessManager};

pub struct UnixProcessManagerFactory;

#[cfg(unix)]
impl shamble_supervisor_core::ProcessManagerFactory for UnixProcessManagerFactory {
    type Manager = UnixProcessManager;

    fn create_process_manager() -> UnixProcessManager {
        <UnixProcessManager as shamble_supervisor_core::ProcessManager>::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
