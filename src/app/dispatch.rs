use crate::app::status::render_status;
use crate::audit::{AuditFilter, AuditQueryService, AuditRecord, AuditService};
use crate::authority::{
    KeyAllowlist, ManifestSignature, PrivilegedCommand, SigningKey, WaCertificate, sign_manifest,
    verify_manifest, wa_id_for,
};
use crate::cli::{AuditCommands, Cli, Commands, WaCommands};
use crate::config::Config;
use crate::persistence::sqlite::connect;
use crate::runtime::{
    CirisRuntime, InboxKind, TaskRequest, deliver, read_status, state_file_path,
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub async fn dispatch(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run => {
            info!(agent_id = %config.agent.agent_id, "starting CIRIS runtime");
            let runtime = Arc::new(CirisRuntime::build(config).await?);
            runtime.run().await
        }

        Commands::Submit {
            description,
            priority,
            channel,
            requester,
        } => {
            let request = TaskRequest {
                description,
                priority,
                channel_id: channel,
                requester_id: requester,
            };
            let path = deliver(&config, InboxKind::Tasks, &request)?;
            println!("✓ Task queued: {}", path.display());
            Ok(())
        }

        Commands::Status => {
            let status = read_status(&state_file_path(&config)).ok();
            println!("{}", render_status(&config, status.as_ref()));
            Ok(())
        }

        Commands::Audit { audit_command } => handle_audit(audit_command, &config).await,

        Commands::Wa { wa_command } => handle_wa(wa_command, &config),
    }
}

async fn open_audit(config: &Config) -> Result<AuditService> {
    let pool = connect(&config.database_url())
        .await
        .with_context(|| format!("failed to open {}", config.database_path().display()))?;
    let signer = config
        .audit
        .signing_key_path
        .as_deref()
        .map(SigningKey::load)
        .transpose()?;
    Ok(AuditService::new(pool, signer).await?)
}

fn render_record(record: &AuditRecord) -> String {
    let hits = if record.entry.guardrail_hits.is_empty() {
        String::new()
    } else {
        format!(" hits={}", record.entry.guardrail_hits.join(","))
    };
    format!(
        "{:>6}  {}  {:<8} {:<9} {:<20} {}{}",
        record.sequence,
        record.recorded_at.format("%Y-%m-%dT%H:%M:%SZ"),
        record.entry.direction,
        record.entry.outcome,
        record.entry.action,
        record.entry.stakeholder,
        hits
    )
}

async fn handle_audit(command: AuditCommands, config: &Config) -> Result<()> {
    let audit = open_audit(config).await?;
    match command {
        AuditCommands::Verify => {
            let report = audit.verify_chain().await?;
            println!(
                "✓ Audit chain intact: {} records, {} signatures checked",
                report.records, report.signatures_checked
            );
            println!("  Last hash: {}", report.last_hash);
            Ok(())
        }
        AuditCommands::Query {
            limit,
            offset,
            stakeholder,
            outcome,
            correlation,
            since,
            until,
            json,
        } => {
            let filter = AuditFilter {
                start: since,
                end: until,
                stakeholder,
                outcome,
                correlation_id: correlation,
                limit,
                offset,
            };
            let records = audit.query(&filter).await?;
            for record in &records {
                if json {
                    println!("{}", serde_json::to_string(record)?);
                } else {
                    println!("{}", render_record(record));
                }
            }
            if !json {
                println!("({} records)", records.len());
            }
            Ok(())
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn handle_wa(command: WaCommands, config: &Config) -> Result<()> {
    match command {
        WaCommands::Keygen {
            out,
            name,
            role,
            scopes,
        } => {
            let key = SigningKey::generate()?;
            key.save(&out)?;
            let certificate = WaCertificate::new(name, role, &key, scopes);
            let cert_path = out.with_extension("cert.json");
            std::fs::write(&cert_path, serde_json::to_vec_pretty(&certificate)?)
                .with_context(|| format!("failed to write {}", cert_path.display()))?;

            println!("✓ Key written to {}", out.display());
            println!("  Certificate: {}", cert_path.display());
            println!("  Fingerprint: {}", certificate.fingerprint);
            println!();
            println!("Trust it by adding to config.toml:");
            println!();
            println!("[[wise_authority.trusted_keys]]");
            println!("wa_id = \"{}\"", certificate.wa_id);
            println!("public_key = \"{}\"", certificate.public_key);
            if let Some(scopes) = certificate.trusted_key().scopes {
                println!("scopes = {scopes:?}");
            }
            Ok(())
        }

        WaCommands::SignCommand {
            key,
            wa_id,
            command_type,
            reason,
            target,
            expires_in,
            deliver: to_inbox,
        } => {
            let key = SigningKey::load(&key)?;
            let wa_id = wa_id.unwrap_or_else(|| wa_id_for(&key));
            let target = target.unwrap_or_else(|| config.agent.agent_id.clone());
            let expires_at = expires_in.map(|secs| Utc::now() + chrono::Duration::seconds(secs));
            let command =
                PrivilegedCommand::signed(command_type, wa_id, &key, reason, target, expires_at)?;

            if to_inbox {
                let path = deliver(config, InboxKind::Commands, &command)?;
                println!("✓ Command {} delivered: {}", command.command_id, path.display());
            } else {
                println!("{}", serde_json::to_string_pretty(&command)?);
            }
            Ok(())
        }

        WaCommands::VerifyCommand { file } => {
            let command: PrivilegedCommand = read_json(&file)?;
            let allowlist = KeyAllowlist::from_config(&config.wise_authority);
            allowlist.verify_command(&command, &config.agent.agent_id, Utc::now())?;
            println!(
                "✓ {} from {} is valid for {}",
                command.command_type, command.wa_id, command.target_agent_id
            );
            Ok(())
        }

        WaCommands::SignManifest { key, wa_id, file } => {
            let key = SigningKey::load(&key)?;
            let wa_id = wa_id.unwrap_or_else(|| wa_id_for(&key));
            let contents =
                std::fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;
            let signature = sign_manifest(&wa_id, &key, &contents);
            println!("{}", serde_json::to_string_pretty(&signature)?);
            Ok(())
        }

        WaCommands::VerifyManifest { file, signature } => {
            let manifest: ManifestSignature = read_json(&signature)?;
            let contents =
                std::fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;
            let allowlist = KeyAllowlist::from_config(&config.wise_authority);
            verify_manifest(&contents, &manifest, &allowlist)?;
            println!("✓ {} matches {} signed by {}", file.display(), manifest.sha256, manifest.wa_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{CommandType, WaRole};
    use crate::config::TrustedKey;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> Config {
        Config {
            config_path: tmp.path().join("config.toml"),
            data_dir: tmp.path().to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn keygen_then_sign_and_verify_a_command() {
        let tmp = TempDir::new().unwrap();
        let key_path = tmp.path().join("wa.key");
        let mut config = config(&tmp);

        handle_wa(
            WaCommands::Keygen {
                out: key_path.clone(),
                name: "ops".into(),
                role: WaRole::Authority,
                scopes: vec!["shutdown".into()],
            },
            &config,
        )
        .unwrap();
        let certificate: WaCertificate = read_json(&key_path.with_extension("cert.json")).unwrap();
        config.wise_authority.trusted_keys.push(certificate.trusted_key());

        handle_wa(
            WaCommands::SignCommand {
                key: key_path.clone(),
                wa_id: None,
                command_type: CommandType::ReloadConfig,
                reason: "rotate keys".into(),
                target: None,
                expires_in: Some(600),
                deliver: true,
            },
            &config,
        )
        .unwrap();

        let inbox = crate::runtime::inbox_dir(&config, InboxKind::Commands);
        let delivered = std::fs::read_dir(&inbox)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().is_some_and(|e| e == "json"))
            .unwrap();
        handle_wa(WaCommands::VerifyCommand { file: delivered.clone() }, &config).unwrap();

        let err = handle_wa(
            WaCommands::VerifyCommand { file: delivered },
            &Config {
                wise_authority: Default::default(),
                ..config.clone()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("allowlist"));
    }

    #[test]
    fn manifest_signature_detects_edits() {
        let tmp = TempDir::new().unwrap();
        let key = SigningKey::generate().unwrap();
        let key_path = tmp.path().join("wa.key");
        key.save(&key_path).unwrap();
        let manifest = tmp.path().join("release.toml");
        std::fs::write(&manifest, "version = 1\n").unwrap();

        let mut config = config(&tmp);
        config.wise_authority.trusted_keys.push(TrustedKey {
            wa_id: wa_id_for(&key),
            public_key: key.public_key_b64(),
            scopes: None,
        });

        let signature = sign_manifest(&wa_id_for(&key), &key, b"version = 1\n");
        let sig_path = tmp.path().join("release.sig.json");
        std::fs::write(&sig_path, serde_json::to_vec(&signature).unwrap()).unwrap();

        handle_wa(
            WaCommands::VerifyManifest {
                file: manifest.clone(),
                signature: sig_path.clone(),
            },
            &config,
        )
        .unwrap();

        std::fs::write(&manifest, "version = 2\n").unwrap();
        assert!(
            handle_wa(
                WaCommands::VerifyManifest {
                    file: manifest,
                    signature: sig_path,
                },
                &config,
            )
            .is_err()
        );
    }

    #[tokio::test]
    async fn audit_verify_on_a_fresh_database() {
        let tmp = TempDir::new().unwrap();
        handle_audit(AuditCommands::Verify, &config(&tmp)).await.unwrap();
    }
}
