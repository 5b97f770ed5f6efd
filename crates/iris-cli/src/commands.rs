use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use iris_core::{EyeImage, MatchResult};
use iris_engine::{
    Engine, EngineConfig, EngineError, EnrollmentService, SqliteTemplateStore, TemplateStore,
    VerificationService, VerifyMode,
};
use serde_json::{json, Value};

use crate::output::EXIT_REJECTED;
use crate::{Cli, Commands};

/// JSON body to print plus whether the command reached a negative decision.
pub struct Report {
    pub body: Value,
    pub rejected: bool,
}

impl Report {
    fn ok(body: Value) -> Self {
        Self {
            body,
            rejected: false,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.rejected {
            ExitCode::from(EXIT_REJECTED)
        } else {
            ExitCode::SUCCESS
        }
    }
}

struct App {
    config: EngineConfig,
    store: Arc<SqliteTemplateStore>,
    engine: Engine,
}

impl App {
    async fn open(cli: &Cli) -> Result<Self> {
        let mut config = EngineConfig::load(cli.config.as_deref())?;
        if let Some(db) = &cli.db {
            config.db_path = db.clone();
        }
        let store = SqliteTemplateStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening template store {}", config.db_path.display()))?;
        tracing::debug!(db = %config.db_path.display(), "template store ready");
        let engine = Engine::from_config(config.pipeline.clone(), config.timeout());
        Ok(Self {
            config,
            store: Arc::new(store),
            engine,
        })
    }

    fn load_image(&self, path: &Path) -> Result<EyeImage> {
        load_image(path, self.config.pipeline.preprocess.max_dimension)
    }

    fn enrollment(&self) -> EnrollmentService {
        EnrollmentService::new(
            self.engine.clone(),
            self.store.clone(),
            self.config.enroll_policy,
        )
    }

    fn verification(&self) -> VerificationService {
        VerificationService::hamming(
            self.engine.clone(),
            self.store.clone(),
            self.config.max_shift,
            self.config.min_overlap_bits,
            self.config.match_threshold,
        )
    }
}

pub async fn run(cli: Cli) -> Result<Report> {
    let app = App::open(&cli).await?;
    match cli.command {
        Commands::Enroll {
            identity,
            image,
            policy,
        } => {
            let image = app.load_image(&image)?;
            let outcome = app.enrollment().enroll(&identity, image, policy).await?;
            Ok(Report::ok(json!({
                "status": "enrolled",
                "enrollment": outcome,
            })))
        }
        Commands::Verify { identity, image } => {
            let image = app.load_image(&image)?;
            let result = app
                .verification()
                .verify(image, VerifyMode::Identity(identity.clone()))
                .await?;
            Ok(match_report(&result, Some(&identity)))
        }
        Commands::Identify { image } => {
            let image = app.load_image(&image)?;
            let result = app.verification().verify(image, VerifyMode::Identify).await?;
            Ok(match_report(&result, None))
        }
        Commands::List { identity: Some(identity) } => {
            let record = app
                .store
                .record(&identity)
                .await?
                .ok_or_else(|| EngineError::UnknownIdentity(identity.clone()))?;
            Ok(Report::ok(json!({
                "identity": record.identity,
                "created_at": record.created_at,
                "last_verified_at": record.last_verified_at,
                "templates": record.template_infos(),
            })))
        }
        Commands::List { identity: None } => {
            let identities = app.store.identities().await?;
            Ok(Report::ok(json!({ "identities": identities })))
        }
        Commands::Remove { identity, template } => {
            let removed = match &template {
                Some(id) => app.store.remove_template(&identity, id).await?,
                None => app.store.remove_identity(&identity).await?,
            };
            if !removed && template.is_none() {
                return Err(EngineError::UnknownIdentity(identity).into());
            }
            tracing::info!(identity = %identity, template = ?template, removed, "remove");
            Ok(Report::ok(json!({
                "identity": identity,
                "template": template,
                "removed": removed,
            })))
        }
        Commands::Status => {
            let identities = app.store.identities().await?;
            let templates = app.store.count_templates().await?;
            Ok(Report::ok(json!({
                "version": env!("CARGO_PKG_VERSION"),
                "db_path": app.config.db_path,
                "identities": identities.len(),
                "templates": templates,
                "match_threshold": app.config.match_threshold,
                "max_shift": app.config.max_shift,
                "timeout_ms": app.config.timeout_ms,
                "enroll_policy": app.config.enroll_policy,
            })))
        }
    }
}

fn load_image(path: &Path, max_dimension: u32) -> Result<EyeImage> {
    let bytes = std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
    let image = EyeImage::decode_with_limit(&bytes, max_dimension).map_err(EngineError::from)?;
    Ok(image)
}

fn match_report(result: &MatchResult, claimed: Option<&str>) -> Report {
    let status = if result.is_accept() { "match" } else { "no_match" };
    Report {
        body: json!({
            "status": status,
            "claimed_identity": claimed,
            "result": result,
        }),
        rejected: !result.is_accept(),
    }
}
