/// Non-interactive Azure identity used to log azcopy in.
///
/// Only held in memory. The secret reaches azcopy through its environment and
/// is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct ServicePrincipal {
    pub application_id: String,
    pub secret: String,
    pub tenant_id: String,
}

impl ServicePrincipal {
    pub fn new(
        application_id: impl Into<String>,
        secret: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            application_id: application_id.into(),
            secret: secret.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

impl std::fmt::Debug for ServicePrincipal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePrincipal")
            .field("application_id", &self.application_id)
            .field("secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}
