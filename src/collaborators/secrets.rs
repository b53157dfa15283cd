use std::collections::HashMap;
use std::env;

/// Narrow secrets seam. Paths follow a `configuration/<name>` layout so a
/// real secret store can back this without touching the callers.
pub trait SecretsProvider: Send + Sync {
    fn read(&self, path: &str) -> HashMap<String, String>;
}

/// Environment-backed provider: `configuration/downloader-api` maps to the
/// `DOWNLOADER_API_*` variables, returned with lowercased key remainders.
pub struct EnvSecrets;

impl SecretsProvider for EnvSecrets {
    fn read(&self, path: &str) -> HashMap<String, String> {
        let name = path.rsplit('/').next().unwrap_or(path);
        let prefix = format!("{}_", name.to_uppercase().replace('-', "_"));

        env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(&prefix)
                    .map(|rest| (rest.to_lowercase(), value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_prefixed_environment_variables() {
        env::set_var("TESTER_API_ENABLED", "true");
        env::set_var("TESTER_API_BASE_URL", "http://localhost:9999");

        let secrets = EnvSecrets.read("configuration/tester-api");
        assert_eq!(secrets.get("enabled").map(String::as_str), Some("true"));
        assert_eq!(
            secrets.get("base_url").map(String::as_str),
            Some("http://localhost:9999")
        );

        env::remove_var("TESTER_API_ENABLED");
        env::remove_var("TESTER_API_BASE_URL");
    }
}
