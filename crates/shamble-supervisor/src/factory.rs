use shamble_supervisor_core::{ManagedLauncher, ProcessManagerFactory, SupervisorConfig};

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    #[cfg(unix)]
    type Manager = shamble_supervisor_unix::UnixProcessManager;

    #[cfg(windows)]
    type Manager = shamble_supervisor_windows::WindowsProcessManager;

    fn create_process_manager() -> Self::Manager {
        #[cfg(unix)]
        return shamble_supervisor_unix::UnixProcessManagerFactory::create_process_manager();

        #[cfg(windows)]
        return shamble_supervisor_windows::WindowsProcessManagerFactory::create_process_manager();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return shamble_supervisor_unix::UnixProcessManagerFactory::platform_name();

        #[cfg(windows)]
        return shamble_supervisor_windows::WindowsProcessManagerFactory::platform_name();
    }
}

/// Process manager for the platform this crate was compiled for
pub type PlatformProcessManager = <PlatformProcessManagerFactory as ProcessManagerFactory>::Manager;

/// Launcher spawning backends with the platform process manager
pub type PlatformLauncher = ManagedLauncher<PlatformProcessManager>;

/// Create a launcher honouring the configured termination grace period
pub fn create_launcher(config: &SupervisorConfig) -> PlatformLauncher {
    tracing::debug!(
        platform = PlatformProcessManagerFactory::platform_name(),
        "Creating backend launcher"
    );
    ManagedLauncher::new(
        PlatformProcessManagerFactory::create_process_manager(),
        config.termination_grace(),
    )
}
