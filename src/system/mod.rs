// System module - the machine-wide state dev-proxy reconciles:
// loopback aliases, the hosts file and the pf NAT ruleset

pub mod firewall;
pub mod hosts;
pub mod loopback;

pub use firewall::{Pfctl, RedirectControl, RedirectSync, build_ruleset};
pub use hosts::HostsFile;
pub use loopback::{AliasManager, LoopbackControl, SystemLoopback};

#[cfg(test)]
pub(crate) mod testing {
    use super::{LoopbackControl, RedirectControl};
    use crate::error::{AppError, AppResult};
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;

    /// In-memory interface
    #[derive(Default)]
    pub struct FakeLoopback {
        bound: RefCell<BTreeSet<Ipv4Addr>>,
        failing_bind: RefCell<BTreeSet<Ipv4Addr>>,
        failing_unbind: RefCell<BTreeSet<Ipv4Addr>>,
        bind_calls: Cell<usize>,
    }

    impl FakeLoopback {
        pub fn with(addresses: &[Ipv4Addr]) -> Self {
            let fake = FakeLoopback::default();
            fake.bound.borrow_mut().extend(addresses.iter().copied());
            fake
        }

        pub fn fail_bind(&self, ip: Ipv4Addr) {
            self.failing_bind.borrow_mut().insert(ip);
        }

        pub fn fail_unbind(&self, ip: Ipv4Addr) {
            self.failing_unbind.borrow_mut().insert(ip);
        }

        pub fn bound(&self) -> Vec<Ipv4Addr> {
            self.bound.borrow().iter().copied().collect()
        }

        pub fn bind_calls(&self) -> usize {
            self.bind_calls.get()
        }
    }

    impl LoopbackControl for FakeLoopback {
        fn addresses(&self) -> AppResult<Vec<Ipv4Addr>> {
            Ok(self.bound())
        }

        fn bind(&self, ip: Ipv4Addr) -> AppResult<()> {
            self.bind_calls.set(self.bind_calls.get() + 1);
            if self.failing_bind.borrow().contains(&ip) {
                return Err(AppError::Interface(format!("SIOCAIFADDR {}: Permission denied", ip)));
            }
            self.bound.borrow_mut().insert(ip);
            Ok(())
        }

        fn unbind(&self, ip: Ipv4Addr) -> AppResult<()> {
            if self.failing_unbind.borrow().contains(&ip) {
                return Err(AppError::Interface(format!("SIOCDIFADDR {}: Device busy", ip)));
            }
            self.bound.borrow_mut().remove(&ip);
            Ok(())
        }
    }

    /// In-memory pf: the active ruleset is whatever was loaded last
    #[derive(Default)]
    pub struct FakeFirewall {
        active: RefCell<String>,
        load_calls: Cell<usize>,
        fail: Cell<bool>,
    }

    impl FakeFirewall {
        pub fn fail_loads(&self) {
            self.fail.set(true);
        }

        pub fn active(&self) -> String {
            self.active.borrow().clone()
        }

        pub fn load_calls(&self) -> usize {
            self.load_calls.get()
        }
    }

    impl RedirectControl for FakeFirewall {
        fn load(&self, ruleset: &str) -> AppResult<()> {
            if self.fail.get() {
                return Err(AppError::Firewall("failed to execute pfctl: not found".to_string()));
            }
            self.load_calls.set(self.load_calls.get() + 1);
            *self.active.borrow_mut() = ruleset.to_string();
            Ok(())
        }

        fn active_rules(&self) -> AppResult<String> {
            Ok(self.active())
        }
    }
}
