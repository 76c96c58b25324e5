use async_trait::async_trait;

/// Resolver for the event-provider API key. The deployment wires in whatever
/// backs secret storage; the clients only depend on this seam.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> anyhow::Result<String>;
}

/// Secret name the event client asks for.
pub const EVENTS_API_KEY: &str = "COMMUTE_EVENTS_API_KEY";

/// Environment-backed resolver used by the default deployment.
pub struct EnvSecretResolver;

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn resolve(&self, name: &str) -> anyhow::Result<String> {
        std::env::var(name).map_err(|_| anyhow::anyhow!("secret {name} is not set"))
    }
}

#[cfg(test)]
pub struct StaticSecretResolver(pub String);

#[cfg(test)]
#[async_trait]
impl SecretResolver for StaticSecretResolver {
    async fn resolve(&self, _name: &str) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}
