mod fixture;
mod logging;

/// The tfshim-runner executable
///
/// Runs the legacy shim on local values and state files, without a host or
/// a transport. Useful for inspecting how a resource schema flattens, plans
/// and upgrades.
use anyhow::{bail, Context, Result};
use clap::{CommandFactory as _, Parser, Subcommand};
use serde_json::{json, Map, Value as JsonValue};
use std::io::IsTerminal as _;
use std::path::PathBuf;
use std::process::exit;
use tfshim_core::flatmap::{flatmap_from_value, value_from_flatmap, Flatmap};
use tfshim_core::json::value_from_json;
use tfshim_core::normalize::normalize_flatmap_containers;
use tfshim_core::server::{
    DynamicValue, PlanResourceChangeRequest, UpgradeResourceStateRequest,
};
use tfshim_core::{RawState, ResourceProvider as _, ShimServer, Type, Value};
use tracing::info;

use fixture::FixtureProvider;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    let mut logging = logging::set_up(logging::Options {
        verbose: args.options.verbose,
        color: std::io::stderr().is_terminal(),
    })?;
    let r = run_command(&args.command);
    logging.tear_down()?;
    r
}

fn run_command(command: &Commands) -> Result<()> {
    match command {
        Commands::Flatten { type_json, value_json } => {
            let ty = parse_type(type_json)?;
            let value = value_from_json(&parse_json(value_json, "--value-json")?, &ty)?;
            print_json(&json!(flatmap_from_value(&value, &ty)?))
        }
        Commands::Expand {
            type_json,
            flatmap_json,
        } => {
            let ty = parse_type(type_json)?;
            let flatmap = parse_flatmap(flatmap_json, "--flatmap-json")?;
            print_json(&render(&value_from_flatmap(&flatmap, &ty)?))
        }
        Commands::Normalize {
            reference_json,
            candidate_json,
            apply,
        } => {
            let reference = parse_flatmap(reference_json, "--reference-json")?;
            let candidate = parse_flatmap(candidate_json, "--candidate-json")?;
            print_json(&json!(normalize_flatmap_containers(
                &reference, &candidate, *apply
            )))
        }
        Commands::Plan {
            resource,
            prior_json,
            proposed_json,
        } => block_on(plan(resource, prior_json.as_deref(), proposed_json)),
        Commands::Upgrade {
            resource,
            version,
            flatmap_json,
            state_json,
        } => block_on(upgrade(
            resource,
            *version,
            flatmap_json.as_deref(),
            state_json.as_deref(),
        )),
        Commands::GenerateMan => {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        }
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "tfshim-runner", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn block_on<F: std::future::Future<Output = Result<()>>>(fut: F) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .context("failed to start the async runtime")?;
    runtime.block_on(fut)
}

async fn plan(resource: &ResourceArgs, prior_json: Option<&str>, proposed_json: &str) -> Result<()> {
    let server = ShimServer::new(resource.load()?);
    let type_name = server.provider().type_name().to_string();
    let res = server
        .provider()
        .resource(&type_name)
        .context("fixture has no resource")?;
    let ty = res.implied_type();

    let prior = match prior_json {
        Some(s) => value_from_json(&parse_json(s, "--prior-json")?, &ty)?,
        None => Value::Null,
    };
    let proposed = value_from_json(&parse_json(proposed_json, "--proposed-json")?, &ty)?;
    let proposed = res.core_config_schema().coerce_value(&proposed)?;
    info!(type_name = %type_name, create = prior.is_null(), "planning change");

    let response = server
        .plan_resource_change(PlanResourceChangeRequest {
            type_name,
            prior_state: DynamicValue::encode(&prior, &ty)?,
            proposed_new_state: DynamicValue::encode(&proposed, &ty)?,
            prior_private: Vec::new(),
        })
        .await?;

    let planned_private: JsonValue = if response.planned_private.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&response.planned_private).context("planned private data")?
    };
    print_json(&json!({
        "planned_state": render(&response.planned_state.decode(&ty)?),
        "requires_replace": response
            .requires_replace
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>(),
        "planned_private": planned_private,
    }))
}

async fn upgrade(
    resource: &ResourceArgs,
    version: i64,
    flatmap_json: Option<&str>,
    state_json: Option<&str>,
) -> Result<()> {
    let raw_state = match (flatmap_json, state_json) {
        (Some(_), Some(_)) => bail!("--flatmap-json and --state-json are mutually exclusive"),
        (Some(f), None) => RawState::from_flatmap(parse_flatmap(f, "--flatmap-json")?),
        (None, Some(s)) => RawState::from_json(s.as_bytes().to_vec()),
        (None, None) => RawState::default(),
    };
    let server = ShimServer::new(resource.load()?);
    let type_name = server.provider().type_name().to_string();
    let ty = server
        .provider()
        .resource(&type_name)
        .context("fixture has no resource")?
        .implied_type();
    info!(type_name = %type_name, version, "upgrading state");
    let response = server
        .upgrade_resource_state(UpgradeResourceStateRequest {
            type_name,
            version,
            raw_state,
        })
        .await?;
    print_json(&render(&response.upgraded_state.decode(&ty)?))
}

fn parse_json(s: &str, flag: &str) -> Result<JsonValue> {
    serde_json::from_str(s).with_context(|| format!("failed to parse value of {}", flag))
}

fn parse_type(s: &str) -> Result<Type> {
    let json = parse_json(s, "--type")?;
    Type::from_json(&json).map_err(|e| anyhow::anyhow!("invalid --type: {}", e))
}

fn parse_flatmap(s: &str, flag: &str) -> Result<Flatmap> {
    serde_json::from_str(s)
        .with_context(|| format!("{} must be a JSON object of strings", flag))
}

/// JSON rendering for display. Unknown values have no JSON form, so they are
/// shown as a marker string.
fn render(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Unknown => JsonValue::String("(known after apply)".to_string()),
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Number(n) => JsonValue::Number(n.clone()),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::List(vs) | Value::Set(vs) => JsonValue::Array(vs.iter().map(render).collect()),
        Value::Map(m) | Value::Object(m) => {
            JsonValue::Object(m.iter().map(|(k, v)| (k.clone(), render(v))).collect::<Map<_, _>>())
        }
    }
}

fn print_json(value: &JsonValue) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("tfshim-runner error: {:#}", e);
            exit(1);
        }
    }
}

/// Run the legacy attribute-bag shim locally
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Parser, Debug, Clone)]
struct Options {
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,
}

#[derive(clap::Args, Debug)]
struct ResourceArgs {
    /// JSON file with the legacy schema of the resource type
    #[arg(long)]
    resource: PathBuf,

    /// Name under which the resource type is registered
    #[arg(long("type-name"), default_value = "fixture")]
    type_name: String,
}

impl ResourceArgs {
    fn load(&self) -> Result<FixtureProvider> {
        FixtureProvider::load(&self.type_name, &self.resource)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encode a JSON value of the given type as a flatmap
    Flatten {
        /// The type, in JSON type notation, e.g. `["object",{"a":"string"}]`
        #[arg(long("type"))]
        type_json: String,

        #[arg(long("value-json"))]
        value_json: String,
    },

    /// Decode a flatmap into a value of the given type
    Expand {
        /// The type, in JSON type notation, e.g. `["object",{"a":"string"}]`
        #[arg(long("type"))]
        type_json: String,

        /// The flatmap, as a JSON object of strings
        #[arg(long("flatmap-json"))]
        flatmap_json: String,
    },

    /// Restore container counts in a flatmap from a reference flatmap
    Normalize {
        #[arg(long("reference-json"))]
        reference_json: String,

        #[arg(long("candidate-json"))]
        candidate_json: String,

        /// Normalize the way apply does, rather than plan
        #[arg(long)]
        apply: bool,
    },

    /// Plan a change of a resource from a prior to a proposed value
    Plan {
        #[command(flatten)]
        resource: ResourceArgs,

        /// The prior value; absent for a new instance
        #[arg(long("prior-json"))]
        prior_json: Option<String>,

        #[arg(long("proposed-json"))]
        proposed_json: String,
    },

    /// Upgrade a stored state to the current schema
    Upgrade {
        #[command(flatten)]
        resource: ResourceArgs,

        /// The schema version the state was stored with
        #[arg(long, default_value = "0")]
        version: i64,

        /// The state in flatmap form, as a JSON object of strings
        #[arg(long("flatmap-json"))]
        flatmap_json: Option<String>,

        /// The state as a JSON object
        #[arg(long("state-json"))]
        state_json: Option<String>,
    },

    /// Generate markdown documentation for tfshim-runner
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for tfshim-runner
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for tfshim-runner
    #[command(hide = true)]
    GenerateCompletion {
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}
