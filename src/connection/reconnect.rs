use idm_protocol::ConnectionState;

/// Whether the manager should bring a dropped link back on its own
///
/// `enabled` is the user's preference. `active` is set by a successful
/// connect and cleared by an explicit disconnect, so a link the application
/// tore down stays down until it asks for it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoReconnectPolicy {
    enabled: bool,
    active: bool,
}

impl AutoReconnectPolicy {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            active: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Arm after a successful connect
    pub fn activate(&mut self) {
        if self.enabled {
            self.active = true;
        }
    }

    /// Disarm until the next explicit connect
    pub fn suspend(&mut self) {
        self.active = false;
    }

    pub fn should_run(&self, state: ConnectionState) -> bool {
        self.enabled && self.active && state == ConnectionState::Disconnected
    }
}
