use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use grugthink_server::config::Config;
use grugthink_server::config_store::FileConfigStore;
use grugthink_server::generation::OllamaFactory;
use grugthink_server::platform::LoopbackPlatform;
use grugthink_server::{Error, InstanceUpdate, Supervisor, SupervisorSettings};

#[derive(Parser, Debug)]
#[command(name = "grugthink", version, about = "Supervisor for multiple GrugThink bot instances")]
struct Cli {
	/// Data directory root
	#[arg(long, env = "DATA_DIR")]
	data_dir: Option<PathBuf>,

	/// Instance configuration file
	#[arg(long, env = "CONFIG_FILE")]
	config_file: Option<PathBuf>,

	/// Write logs as JSON lines
	#[arg(long, env = "LOG_JSON")]
	log_json: bool,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the supervisor with the JSON-lines control protocol on stdin/stdout (default)
	Serve,
	/// List configured instances
	List,
	/// Create a stopped instance
	Create {
		#[arg(long)]
		name: String,
		/// Credential name, or env:VAR
		#[arg(long)]
		credential: String,
		#[arg(long, default_value = "evolution_bot")]
		template: String,
		/// Setting override, KEY=VALUE (repeatable)
		#[arg(long = "set", value_parser = parse_key_val)]
		overrides: Vec<(String, String)>,
		#[arg(long)]
		auto_start: bool,
	},
	/// Delete an instance
	Delete { id: String },
	/// Store a named credential in the config file
	SetCredential {
		name: String,
		#[arg(env = "GRUGTHINK_SECRET")]
		secret: String,
	},
	/// Show available templates
	Templates,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
	let (k, v) = s.split_once('=').ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
	let k = k.trim();
	if k.is_empty() {
		return Err(format!("empty key in {s:?}"));
	}
	Ok((k.to_string(), v.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	init_tracing(cli.log_json);
	let mut cfg = Config::load()?;
	if let Some(dir) = cli.data_dir.clone() { cfg.data_dir = dir; }
	if let Some(file) = cli.config_file.clone() { cfg.config_file = file; }

	let store = Arc::new(FileConfigStore::open(&cfg.config_file)?);
	let supervisor = Arc::new(Supervisor::new(
		SupervisorSettings::from_config(&cfg),
		store.clone(),
		Arc::new(LoopbackPlatform::new()),
		Arc::new(OllamaFactory::new(cfg.generation_timeout)?),
	));
	supervisor.load()?;

	match cli.command.unwrap_or(Command::Serve) {
		Command::Serve => serve(supervisor).await?,
		Command::List => println!("{}", serde_json::to_string_pretty(&supervisor.list())?),
		Command::Create { name, credential, template, overrides, auto_start } => {
			let id = supervisor.create(&name, &credential, &template, overrides.into_iter().collect())?;
			if auto_start {
				supervisor.update(&id, InstanceUpdate { auto_start: Some(true), ..Default::default() })?;
			}
			println!("{id}");
		}
		Command::Delete { id } => {
			supervisor.delete(&id).await?;
			println!("deleted {id}");
		}
		Command::SetCredential { name, secret } => {
			store.set_credential(&name, &secret)?;
			println!("stored credential {name}");
		}
		Command::Templates => {
			let templates: BTreeMap<_, _> = store.templates();
			println!("{}", serde_json::to_string_pretty(&templates)?);
		}
	}
	Ok(())
}

fn init_tracing(json: bool) {
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	// stdout carries the control protocol, logs go to stderr
	let registry = tracing_subscriber::registry().with(env_filter);
	if json {
		registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
	} else {
		registry.with(fmt::layer().with_target(false).with_ansi(false).with_writer(std::io::stderr)).init();
	}
}

async fn serve(supervisor: Arc<Supervisor>) -> Result<()> {
	let shutdown = CancellationToken::new();

	let monitor = tokio::spawn(supervisor.clone().monitor_loop(shutdown.clone()));
	let starter = {
		let sup = supervisor.clone();
		tokio::spawn(async move { sup.start_configured().await; })
	};
	let stdio = {
		let sup = supervisor.clone();
		let token = shutdown.clone();
		tokio::spawn(async move { run_stdio(sup, token).await; })
	};

	tokio::select! {
		_ = signal::ctrl_c() => info!("Shutdown signal received"),
		_ = shutdown.cancelled() => info!("Shutdown requested"),
	}
	shutdown.cancel();
	starter.abort();
	stdio.abort();
	supervisor.shutdown().await;
	if let Err(err) = monitor.await { warn!(%err, "monitor task ended abnormally"); }
	Ok(())
}

fn json_error(code: &'static str, message: impl Into<String>) -> JsonValue {
	serde_json::json!({ "code": code, "message": message.into() })
}

async fn run_stdio(supervisor: Arc<Supervisor>, shutdown: CancellationToken) {
	let stdin = tokio::io::stdin();
	let mut reader = BufReader::new(stdin).lines();
	while let Ok(Some(line)) = reader.next_line().await {
		let line = line.trim();
		if line.is_empty() { continue; }
		let v: JsonValue = match serde_json::from_str(line) {
			Ok(x) => x,
			Err(err) => {
				let out = serde_json::json!({ "id": JsonValue::Null, "error": json_error("VALIDATION", format!("bad request: {err}")) });
				println!("{out}");
				continue;
			}
		};
		let id_val = v.get("id").cloned().unwrap_or(JsonValue::Null);
		let method = v.get("method").and_then(|m| m.as_str()).unwrap_or("").to_string();
		let params = v.get("params").cloned().unwrap_or(serde_json::json!({}));

		let mut out = serde_json::json!({ "id": id_val });
		if method == "shutdown" {
			out["result"] = serde_json::json!({ "ok": true });
			println!("{out}");
			shutdown.cancel();
			break;
		}
		match dispatch(&supervisor, &method, params).await {
			Ok(result) => out["result"] = result,
			Err(err) => {
				if !matches!(err, Error::Validation(_) | Error::NotFound { .. }) {
					error!(method = %method, %err, "control request failed");
				}
				out["error"] = json_error(err.code(), err.to_string());
			}
		}
		println!("{out}");
	}
	info!("stdio control loop ended");
}

#[derive(Deserialize)]
struct IdParams {
	id: String,
}

#[derive(Deserialize)]
struct CreateParams {
	name: String,
	credential_ref: String,
	template_id: String,
	#[serde(default)]
	overrides: BTreeMap<String, String>,
	#[serde(default)]
	auto_start: bool,
}

#[derive(Deserialize)]
struct UpdateParams {
	id: String,
	#[serde(flatten)]
	update: InstanceUpdate,
}

#[derive(Deserialize)]
struct TenantParams {
	id: String,
	#[serde(default)]
	tenant: Option<String>,
}

#[derive(Deserialize)]
struct FactParams {
	id: String,
	#[serde(default)]
	tenant: Option<String>,
	text: String,
}

#[derive(Deserialize)]
struct SearchParams {
	id: String,
	#[serde(default)]
	tenant: Option<String>,
	query: String,
	#[serde(default = "default_k")]
	k: usize,
}

fn default_k() -> usize { 5 }

#[derive(Deserialize)]
struct RespondParams {
	id: String,
	#[serde(default)]
	tenant: Option<String>,
	user_id: String,
	statement: String,
}

#[derive(Deserialize)]
struct LoreParams {
	id: String,
	#[serde(default)]
	tenant: Option<String>,
	path: PathBuf,
}

fn parse<T: serde::de::DeserializeOwned>(params: JsonValue) -> grugthink_server::Result<T> {
	serde_json::from_value(params).map_err(|e| Error::Validation(format!("invalid params: {e}")))
}

fn to_json<T: serde::Serialize>(value: T) -> grugthink_server::Result<JsonValue> {
	Ok(serde_json::to_value(value)?)
}

async fn dispatch(sup: &Supervisor, method: &str, params: JsonValue) -> grugthink_server::Result<JsonValue> {
	match method {
		"list" => to_json(sup.list()),
		"status" => {
			let p: IdParams = parse(params)?;
			let report = sup.status(&p.id).ok_or_else(|| Error::not_found("instance", &p.id))?;
			to_json(report)
		}
		"create" => {
			let p: CreateParams = parse(params)?;
			let id = sup.create(&p.name, &p.credential_ref, &p.template_id, p.overrides)?;
			if p.auto_start {
				sup.update(&id, InstanceUpdate { auto_start: Some(true), ..Default::default() })?;
			}
			Ok(serde_json::json!({ "id": id }))
		}
		"update" => {
			let p: UpdateParams = parse(params)?;
			to_json(sup.update(&p.id, p.update)?)
		}
		"start" => {
			let p: IdParams = parse(params)?;
			Ok(serde_json::json!({ "ok": sup.start(&p.id).await? }))
		}
		"stop" => {
			let p: IdParams = parse(params)?;
			Ok(serde_json::json!({ "ok": sup.stop(&p.id).await? }))
		}
		"restart" => {
			let p: IdParams = parse(params)?;
			Ok(serde_json::json!({ "ok": sup.restart(&p.id).await? }))
		}
		"delete" => {
			let p: IdParams = parse(params)?;
			sup.delete(&p.id).await?;
			Ok(serde_json::json!({ "ok": true }))
		}
		"add_fact" => {
			let p: FactParams = parse(params)?;
			let added = sup.add_fact(&p.id, p.tenant.as_deref(), &p.text).await?;
			Ok(serde_json::json!({ "added": added }))
		}
		"search_facts" => {
			let p: SearchParams = parse(params)?;
			to_json(sup.search_facts(&p.id, p.tenant.as_deref(), &p.query, p.k).await?)
		}
		"get_all_facts" => {
			let p: TenantParams = parse(params)?;
			to_json(sup.get_all_facts(&p.id, p.tenant.as_deref()).await?)
		}
		"rebuild_index" => {
			let p: TenantParams = parse(params)?;
			let vectors = sup.rebuild_index(&p.id, p.tenant.as_deref()).await?;
			Ok(serde_json::json!({ "vectors": vectors }))
		}
		"import_lore" => {
			let p: LoreParams = parse(params)?;
			let migrated = sup.import_lore(&p.id, p.tenant.as_deref(), &p.path).await?;
			Ok(serde_json::json!({ "migrated": migrated }))
		}
		"tenant_stats" => {
			let p: IdParams = parse(params)?;
			to_json(sup.tenant_stats(&p.id)?)
		}
		"respond" => {
			let p: RespondParams = parse(params)?;
			to_json(sup.respond(&p.id, p.tenant.as_deref(), &p.user_id, &p.statement).await?)
		}
		other => Err(Error::Validation(format!("unknown method: {other}"))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn make_supervisor(dir: &std::path::Path) -> Supervisor {
		let store = Arc::new(FileConfigStore::open(&dir.join("grugthink_config.json")).unwrap());
		store.set_credential("main", "tok").unwrap();
		let mut settings = SupervisorSettings::new(&dir.join("data"));
		settings.start_timeout = Duration::from_millis(200);
		settings.stop_grace = Duration::from_millis(100);
		Supervisor::new(
			settings,
			store,
			Arc::new(LoopbackPlatform::new()),
			Arc::new(OllamaFactory::new(Duration::from_secs(1)).unwrap()),
		)
	}

	#[test]
	fn key_val_overrides_parse() {
		assert_eq!(parse_key_val("OLLAMA_MODELS=a,b").unwrap(), ("OLLAMA_MODELS".into(), "a,b".into()));
		assert!(parse_key_val("novalue").is_err());
		assert!(parse_key_val("=x").is_err());
	}

	#[tokio::test]
	async fn control_protocol_drives_instance_and_facts() {
		let dir = tempfile::tempdir().unwrap();
		let sup = make_supervisor(dir.path());
		let created = dispatch(&sup, "create", serde_json::json!({
			"name": "Grug", "credential_ref": "main", "template_id": "pure_grug"
		})).await.unwrap();
		let id = created["id"].as_str().unwrap().to_string();

		let err = dispatch(&sup, "add_fact", serde_json::json!({ "id": id, "tenant": "A", "text": "Fire hot." })).await.unwrap_err();
		assert_eq!(err.code(), "LIFECYCLE");

		assert_eq!(dispatch(&sup, "start", serde_json::json!({ "id": id })).await.unwrap()["ok"], true);
		let added = dispatch(&sup, "add_fact", serde_json::json!({ "id": id, "tenant": "A", "text": "Fire hot." })).await.unwrap();
		assert_eq!(added["added"], true);
		let facts = dispatch(&sup, "get_all_facts", serde_json::json!({ "id": id, "tenant": "A" })).await.unwrap();
		assert_eq!(facts, serde_json::json!(["Fire hot."]));
		let status = dispatch(&sup, "status", serde_json::json!({ "id": id })).await.unwrap();
		assert_eq!(status["status"], "running");

		// no backend configured for pure_grug, so the polite fallback comes back
		let reply = dispatch(&sup, "respond", serde_json::json!({
			"id": id, "tenant": "A", "user_id": "u1", "statement": "is fire hot?"
		})).await.unwrap();
		assert_eq!(reply["source"], "fallback");

		assert_eq!(dispatch(&sup, "delete", serde_json::json!({ "id": id })).await.unwrap()["ok"], true);
		assert_eq!(dispatch(&sup, "list", JsonValue::Null).await.unwrap(), serde_json::json!([]));
	}

	#[tokio::test]
	async fn control_errors_carry_codes() {
		let dir = tempfile::tempdir().unwrap();
		let sup = make_supervisor(dir.path());
		assert_eq!(dispatch(&sup, "nope", serde_json::json!({})).await.unwrap_err().code(), "VALIDATION");
		assert_eq!(dispatch(&sup, "start", serde_json::json!({})).await.unwrap_err().code(), "VALIDATION");
		assert_eq!(dispatch(&sup, "stop", serde_json::json!({ "id": "missing" })).await.unwrap_err().code(), "NOT_FOUND");
		let body = json_error("NOT_FOUND", "instance not found: missing");
		assert_eq!(body["code"], "NOT_FOUND");
	}
}
