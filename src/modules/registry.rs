use super::ValidationModule;
use crate::error::{AccountError, Result};
use std::sync::Arc;

/// The account's two module slots.
///
/// The default module fixed the account's deployment identity and cannot change once
/// the registry exists. The active module signs operations and can be swapped; swapping
/// while an operation is being built is the caller's responsibility to avoid.
#[derive(Clone, Debug, Default)]
pub struct ValidationModuleRegistry {
    default: Option<Arc<dyn ValidationModule>>,
    active: Option<Arc<dyn ValidationModule>>,
}

impl ValidationModuleRegistry {
    /// Uses `default` for both slots until another module is activated.
    pub fn new(default: Arc<dyn ValidationModule>) -> Self {
        Self {
            active: Some(default.clone()),
            default: Some(default),
        }
    }

    pub fn set_active(&mut self, module: Arc<dyn ValidationModule>) {
        tracing::info!(module = ?module.address(), "activating validation module");
        self.active = Some(module);
    }

    pub fn get_default(&self) -> Result<Arc<dyn ValidationModule>> {
        self.default
            .clone()
            .ok_or(AccountError::ModuleNotConfigured("default"))
    }

    pub fn get_active(&self) -> Result<Arc<dyn ValidationModule>> {
        self.active
            .clone()
            .ok_or(AccountError::ModuleNotConfigured("active"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::EcdsaOwnershipModule;
    use ethers::signers::LocalWallet;
    use ethers::types::Address;

    fn module(byte: u8) -> Arc<dyn ValidationModule> {
        let wallet: LocalWallet =
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
                .parse()
                .unwrap();
        Arc::new(EcdsaOwnershipModule::new(Address::repeat_byte(byte), wallet))
    }

    #[test]
    fn empty_registry_reports_missing_modules() {
        let registry = ValidationModuleRegistry::default();
        assert!(matches!(
            registry.get_default(),
            Err(AccountError::ModuleNotConfigured("default"))
        ));
        assert!(matches!(
            registry.get_active(),
            Err(AccountError::ModuleNotConfigured("active"))
        ));
    }

    #[test]
    fn swapping_active_keeps_default() {
        let mut registry = ValidationModuleRegistry::new(module(0x01));
        assert_eq!(registry.get_active().unwrap().address(), Address::repeat_byte(0x01));

        registry.set_active(module(0x02));
        assert_eq!(registry.get_active().unwrap().address(), Address::repeat_byte(0x02));
        assert_eq!(registry.get_default().unwrap().address(), Address::repeat_byte(0x01));
    }
}
