//! Layered configuration resolution, including the remote secret store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use httpmock::prelude::*;
use serde_json::json;
use url::Url;

use catalog_host::config::{
    ConfigError, KeyVaultClient, ResolverOptions, SecretStore, SecretStoreError, VaultSettings,
};
use catalog_host::net::{select_ports, PortPair};
use catalog_host::ConfigurationResolver;

mod common;

#[tokio::test]
async fn later_layers_override_earlier_ones() {
    let dir = tempfile::tempdir().unwrap();
    common::write_settings(
        dir.path(),
        &json!({
            "PORT": 5101,
            "GRPC_PORT": 5111,
            "Serilog": { "SeqServerUrl": "http://seq-file", "LogstashUrl": "http://logstash-file" }
        }),
    );
    std::fs::write(
        dir.path().join("appsettings.Development.json"),
        r#"{ "Serilog": { "SeqServerUrl": "http://seq-development" } }"#,
    )
    .unwrap();

    let config = common::resolver(
        dir.path(),
        &[
            ("APP_ENVIRONMENT", "Development"),
            ("GRPC_PORT", "6111"),
            ("Serilog__LogstashUrl", "http://logstash-env"),
        ],
    )
    .with_overrides(vec![("grpc_port".into(), "7111".into())])
    .resolve()
    .await
    .unwrap();

    assert_eq!(config.get("Serilog:SeqServerUrl"), Some("http://seq-development"));
    assert_eq!(config.get("Serilog:LogstashUrl"), Some("http://logstash-env"));
    assert_eq!(select_ports(&config), PortPair { primary: 5101, rpc: 7111 });
}

#[tokio::test]
async fn missing_base_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let err = common::resolver(dir.path(), &[("PORT", "5101")]).resolve().await.unwrap_err();
    assert!(matches!(err, ConfigError::Missing { .. }));
}

#[tokio::test]
async fn malformed_base_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("appsettings.json"), "{ \"PORT\": ").unwrap();
    let err = common::resolver(dir.path(), &[]).resolve().await.unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[tokio::test]
async fn toml_base_file_is_supported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("appsettings.toml"),
        "PORT = 5101\n[Serilog]\nSeqServerUrl = \"http://seq-toml\"\n",
    )
    .unwrap();

    let config = ConfigurationResolver::new(ResolverOptions::new(dir.path()).file_name("appsettings.toml"))
        .with_environment(catalog_host::config::EnvironmentSource::from_vars(Vec::<(String, String)>::new()))
        .resolve()
        .await
        .unwrap();

    assert_eq!(config.get("serilog:seqserverurl"), Some("http://seq-toml"));
    assert_eq!(select_ports(&config), PortPair { primary: 5101, rpc: 81 });
}

#[tokio::test]
async fn secret_store_is_never_built_unless_enabled() {
    for flag in [None, Some("false"), Some("yes"), Some("1"), Some("")] {
        let dir = tempfile::tempdir().unwrap();
        let settings = match flag {
            Some(value) => json!({ "UseVault": value, "Vault": { "Name": "catalog-kv" } }),
            None => json!({ "Vault": { "Name": "catalog-kv" } }),
        };
        common::write_settings(dir.path(), &settings);

        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let factory = move |_: &VaultSettings| -> Result<Box<dyn SecretStore>, SecretStoreError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(SecretStoreError::MissingName)
        };

        let config = common::resolver(dir.path(), &[])
            .with_secret_store(Arc::new(factory))
            .resolve()
            .await
            .unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 0, "flag {flag:?}");
        assert_eq!(config.get("Vault:Name"), Some("catalog-kv"));
    }
}

#[tokio::test]
async fn enabled_store_without_a_name_fails() {
    let dir = tempfile::tempdir().unwrap();
    common::write_settings(dir.path(), &json!({ "UseVault": true }));

    let err = common::resolver(dir.path(), &[]).resolve().await.unwrap_err();
    assert!(matches!(err, ConfigError::SecretStore(SecretStoreError::MissingName)));
}

#[tokio::test]
async fn secrets_override_file_and_environment() {
    let server = MockServer::start_async().await;
    let base = server.base_url();

    let probe = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/secrets")
                .query_param("api-version", "7.4")
                .header_missing("authorization");
            then.status(401).header(
                "WWW-Authenticate",
                format!("Bearer authorization=\"{base}/tenant\", resource=\"https://vault.azure.net\""),
            );
        })
        .await;
    let token = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/tenant/oauth2/token")
                .body_includes("client_id=catalog-app")
                .body_includes("client_secret=s3cret");
            then.status(200).json_body(json!({ "access_token": "vault-token" }));
        })
        .await;
    let list = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/secrets")
                .header("authorization", "Bearer vault-token");
            then.status(200).json_body(json!({
                "value": [
                    { "id": format!("{base}/secrets/Serilog--SeqServerUrl"), "attributes": { "enabled": true } },
                    { "id": format!("{base}/secrets/PORT") },
                    { "id": format!("{base}/secrets/Retired"), "attributes": { "enabled": false } }
                ],
                "nextLink": null
            }));
        })
        .await;
    let seq_secret = server
        .mock_async(|when, then| {
            when.method(GET).path("/secrets/Serilog--SeqServerUrl");
            then.status(200).json_body(json!({ "value": "http://seq-vault" }));
        })
        .await;
    let port_secret = server
        .mock_async(|when, then| {
            when.method(GET).path("/secrets/PORT");
            then.status(200).json_body(json!({ "value": "7101" }));
        })
        .await;
    let retired = server
        .mock_async(|when, then| {
            when.method(GET).path("/secrets/Retired");
            then.status(200).json_body(json!({ "value": "never" }));
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    common::write_settings(
        dir.path(),
        &json!({
            "PORT": 5101,
            "UseVault": "True",
            "Vault": { "Name": "catalog-kv", "ClientId": "catalog-app" },
            "Serilog": { "SeqServerUrl": "http://seq-file" }
        }),
    );

    let endpoint = Url::parse(&base).unwrap();
    let factory = move |settings: &VaultSettings| -> Result<Box<dyn SecretStore>, SecretStoreError> {
        assert_eq!(settings.name, "catalog-kv");
        Ok(Box::new(KeyVaultClient::new(
            endpoint.clone(),
            settings.client_id.clone(),
            settings.client_secret.clone(),
        )))
    };

    let config = common::resolver(
        dir.path(),
        &[("PORT", "6101"), ("Vault__ClientSecret", "s3cret")],
    )
    .with_secret_store(Arc::new(factory))
    .resolve()
    .await
    .unwrap();

    assert_eq!(config.get("Serilog:SeqServerUrl"), Some("http://seq-vault"));
    assert_eq!(select_ports(&config).primary, 7101);
    assert_eq!(config.get("Retired"), None);

    probe.assert_hits_async(1).await;
    token.assert_hits_async(1).await;
    list.assert_hits_async(1).await;
    seq_secret.assert_hits_async(1).await;
    port_secret.assert_hits_async(1).await;
    retired.assert_hits_async(0).await;
}

#[tokio::test]
async fn rejected_credentials_fail_resolution() {
    let server = MockServer::start_async().await;
    let base = server.base_url();

    server
        .mock_async(|when, then| {
            when.method(GET).path("/secrets").header_missing("authorization");
            then.status(401).header(
                "WWW-Authenticate",
                format!("Bearer authorization=\"{base}/tenant\", resource=\"https://vault.azure.net\""),
            );
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/tenant/oauth2/token");
            then.status(400);
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    common::write_settings(dir.path(), &json!({ "UseVault": true, "Vault": { "Name": "catalog-kv" } }));

    let endpoint = Url::parse(&base).unwrap();
    let factory = move |settings: &VaultSettings| -> Result<Box<dyn SecretStore>, SecretStoreError> {
        Ok(Box::new(KeyVaultClient::new(
            endpoint.clone(),
            settings.client_id.clone(),
            settings.client_secret.clone(),
        )))
    };

    let err = common::resolver(dir.path(), &[])
        .with_secret_store(Arc::new(factory))
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigError::SecretStore(SecretStoreError::Authentication(400))));
}

#[tokio::test]
async fn repeated_next_link_ends_the_listing() {
    let server = MockServer::start_async().await;
    let base = server.base_url();

    server
        .mock_async(|when, then| {
            when.method(GET).path("/secrets").header_missing("authorization");
            then.status(401).header(
                "WWW-Authenticate",
                format!("Bearer authorization=\"{base}/tenant\", resource=\"https://vault.azure.net\""),
            );
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/tenant/oauth2/token");
            then.status(200).json_body(json!({ "access_token": "vault-token" }));
        })
        .await;
    let list = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/secrets")
                .header("authorization", "Bearer vault-token");
            then.status(200).json_body(json!({
                "value": [ { "id": format!("{base}/secrets/PORT") } ],
                "nextLink": format!("{base}/secrets?api-version=7.4")
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/secrets/PORT");
            then.status(200).json_body(json!({ "value": "7101" }));
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    common::write_settings(dir.path(), &json!({ "UseVault": true, "Vault": { "Name": "catalog-kv" } }));

    let endpoint = Url::parse(&base).unwrap();
    let factory = move |settings: &VaultSettings| -> Result<Box<dyn SecretStore>, SecretStoreError> {
        Ok(Box::new(KeyVaultClient::new(
            endpoint.clone(),
            settings.client_id.clone(),
            settings.client_secret.clone(),
        )))
    };

    let config = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        common::resolver(dir.path(), &[]).with_secret_store(Arc::new(factory)).resolve(),
    )
    .await
    .expect("secret listing never finished")
    .unwrap();

    assert_eq!(select_ports(&config).primary, 7101);
    list.assert_hits_async(1).await;
}
