use std::sync::Arc;

use clap::{Parser, Subcommand};

use rankcard::insights::agent::MixtapeGenerator;
use rankcard::{
    AnalysisType, BatchCollector, InsightOptions, InsightSession, InsightStatus, KeywordOutcome,
    RankCard, ReportCard, ReportPeriod, SerpClient,
};

#[derive(Parser)]
#[command(name = "rankcard", about = "Search ranking tracker and report card CLI")]
struct Cli {
    /// Database path (default: ~/.rankcard/rankcard.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl rankcard::CollectProgress for StderrProgress {
    fn on_keyword_start(&self, phrase: &str, index: usize, total: usize) {
        eprintln!("[{}/{}] {}...", index + 1, total, phrase);
    }

    fn on_page_fetched(&self, _phrase: &str, page: u32, results: usize) {
        eprintln!("  Page {page}: {results} results");
    }

    fn on_keyword_complete(&self, result: &rankcard::KeywordResult) {
        match (result.outcome, result.position) {
            (KeywordOutcome::Succeeded, Some(0)) => eprintln!("  Not found"),
            (KeywordOutcome::Succeeded, Some(p)) => eprintln!("  Position {p}"),
            (outcome, _) => eprintln!(
                "  {}: {}",
                outcome_label(outcome),
                result.detail.as_deref().unwrap_or("")
            ),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Collect rankings for every active keyword
    Collect {
        /// Mark batches left running by a crashed process as abandoned first
        #[arg(long)]
        force: bool,
    },
    /// Show the running or most recent batch
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compute the report card for a period
    Report {
        /// Period: 7d, 30d, 90d, 1y, all (or last7Days, ...)
        #[arg(long, default_value = "30d")]
        period: String,
        /// Evaluate as of this date (YYYY-MM-DD, default today)
        #[arg(long)]
        as_of: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate and manage insights
    Insights {
        #[command(subcommand)]
        action: InsightsAction,
    },
    /// Position history for one keyword
    History {
        keyword_id: i64,
        #[arg(long, default_value = "30d")]
        period: String,
        #[arg(long)]
        json: bool,
    },
    /// Manage tracked keywords
    Keyword {
        #[command(subcommand)]
        action: KeywordAction,
    },
    /// Manage competitors
    Competitor {
        #[command(subcommand)]
        action: CompetitorAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum InsightsAction {
    /// Analyse the current report card (cached per report content)
    Generate {
        #[arg(long, default_value = "30d")]
        period: String,
        /// Analysis type: comprehensive, quick_wins, competitive, trends
        #[arg(long = "type", default_value = "comprehensive")]
        analysis_type: String,
        /// Areas to emphasise (repeatable)
        #[arg(long)]
        focus: Vec<String>,
        /// Regenerate even if a cached session exists
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show a stored session
    Show {
        session_id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Change an insight's status: new, in_progress, completed, dismissed
    Update {
        insight_id: i64,
        status: String,
        #[arg(long)]
        notes: Option<String>,
        /// Who actioned it (required for completed/dismissed)
        #[arg(long)]
        actor: Option<String>,
    },
}

#[derive(Subcommand)]
enum KeywordAction {
    /// Track a keyword phrase
    Add { phrase: String },
    /// List tracked keywords
    List {
        /// Include deactivated keywords
        #[arg(long)]
        all: bool,
    },
    /// Stop tracking a keyword (history is kept)
    Deactivate { keyword_id: i64 },
}

#[derive(Subcommand)]
enum CompetitorAction {
    /// Add a competitor by name and URL or domain
    Add { name: String, url: String },
    /// List competitors
    List {
        #[arg(long)]
        all: bool,
    },
    /// Stop comparing against a competitor
    Deactivate { competitor_id: i64 },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => rankcard::Database::open_at(path).await?,
        None => rankcard::Database::open().await?,
    };
    let app = RankCard::new(db).await?;

    match cli.command {
        Commands::Collect { force } => handle_collect(app, force).await?,
        Commands::Status { json } => print_status(&app, json).await?,
        Commands::Report {
            period,
            as_of,
            json,
        } => {
            let period = ReportPeriod::parse(&period)?;
            let card = match as_of {
                Some(d) => {
                    let date = rankcard::date_util::parse_date(&d)?;
                    app.report_card_as_of(period, date).await?
                }
                None => app.report_card(period).await?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&card)?);
            } else {
                print_report(&card);
            }
        }
        Commands::Insights { action } => handle_insights(app, action).await?,
        Commands::History {
            keyword_id,
            period,
            json,
        } => {
            let period = ReportPeriod::parse(&period)?;
            let history = app.keyword_history(keyword_id, period).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else {
                println!("{} ({period})", history.keyword);
                if history.points.is_empty() {
                    println!("  No snapshots in this period.");
                }
                for point in &history.points {
                    println!("  {}  {}", point.date, position_label(point.position));
                }
                if let Some(best) = history.best_position() {
                    println!("Best: #{best}");
                }
            }
        }
        Commands::Keyword { action } => handle_keyword(&app, action).await?,
        Commands::Competitor { action } => handle_competitor(&app, action).await?,
        Commands::Config { action } => handle_config(&app, action).await?,
    }

    Ok(())
}

async fn handle_collect(app: RankCard, force: bool) -> anyhow::Result<()> {
    let settings = app.collector_settings().await?;
    if force {
        let released = app.abandon_running_batches().await?;
        if released > 0 {
            eprintln!("Released {released} batch(es) left running.");
        }
    }
    let api_key = std::env::var(rankcard::collect::fetcher::API_KEY_ENV).map_err(|_| {
        anyhow::anyhow!(
            "{} is not set. Export your search API key first.",
            rankcard::collect::fetcher::API_KEY_ENV
        )
    })?;
    let client = SerpClient::with_base_url(
        &api_key,
        &settings.serp_engine,
        settings.results_per_page,
        settings.request_timeout_secs,
        &settings.serp_base_url,
    )?;
    let collector = Arc::new(BatchCollector::new(
        app.db().clone(),
        Arc::new(client),
        settings,
    ));

    let stop = collector.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping after the current keyword...");
            stop.stop();
        }
    });

    let app = app.with_collector(collector);
    let stats = match app.run_batch(&StderrProgress).await {
        Err(rankcard::Error::BatchInProgress) => anyhow::bail!(
            "another batch is already running. If its process died, rerun with --force"
        ),
        result => result?,
    };

    println!();
    println!("Batch {}", stats.run_id.unwrap_or_default());
    println!("  Submitted:      {}", stats.submitted);
    println!("  Succeeded:      {}", stats.succeeded);
    println!("  Failed:         {}", stats.failed);
    println!("  Circuit broken: {}", stats.circuit_broken);
    println!("  Skipped:        {}", stats.skipped);
    Ok(())
}

async fn print_status(app: &RankCard, json: bool) -> anyhow::Result<()> {
    let Some(status) = app.batch_status().await? else {
        println!("No batches have run yet.");
        return Ok(());
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    let stats = &status.stats;
    println!("Batch Status: {}", status.status);
    println!(
        "  Started:        {}",
        status.started_at.as_deref().unwrap_or("-")
    );
    println!(
        "  Completed:      {}",
        status.completed_at.as_deref().unwrap_or("-")
    );
    println!("  Processed:      {}/{}", stats.processed, stats.submitted);
    println!("  Succeeded:      {}", stats.succeeded);
    println!("  Failed:         {}", stats.failed);
    println!("  Circuit broken: {}", stats.circuit_broken);
    println!("  Skipped:        {}", stats.skipped);
    if let Some(err) = &status.error {
        println!("  Error:          {err}");
    }
    Ok(())
}

async fn handle_insights(app: RankCard, action: InsightsAction) -> anyhow::Result<()> {
    match action {
        InsightsAction::Generate {
            period,
            analysis_type,
            focus,
            force,
            json,
        } => {
            let period = ReportPeriod::parse(&period)?;
            let options = InsightOptions {
                analysis_type: AnalysisType::parse(&analysis_type)?,
                focus_areas: focus,
                force_regenerate: force,
            };
            let card = app.report_card(period).await?;
            let generator = MixtapeGenerator::from_config(app.db()).await?;
            let app = app.with_generator(Box::new(generator));
            let session = app.insights(&card, &options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                print_session(&session);
            }
        }
        InsightsAction::Show { session_id, json } => {
            let session = app.insight_session(session_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                print_session(&session);
            }
        }
        InsightsAction::Update {
            insight_id,
            status,
            notes,
            actor,
        } => {
            let status = InsightStatus::parse(&status)?;
            let record = app.update_insight(insight_id, status, notes, actor).await?;
            println!("Insight {} is now {}.", record.id, record.status);
        }
    }
    Ok(())
}

async fn handle_keyword(app: &RankCard, action: KeywordAction) -> anyhow::Result<()> {
    match action {
        KeywordAction::Add { phrase } => {
            let id = app.keyword_add(&phrase).await?;
            println!("Added keyword {id}: {}", phrase.trim());
        }
        KeywordAction::List { all } => {
            let keywords = app.keyword_list(all).await?;
            if keywords.is_empty() {
                println!("No tracked keywords. Use 'keyword add' first.");
            }
            for k in keywords {
                let flag = if k.is_active { "" } else { " (inactive)" };
                println!("{:>5}  {}{flag}", k.id, k.phrase);
            }
        }
        KeywordAction::Deactivate { keyword_id } => {
            if app.keyword_deactivate(keyword_id).await? {
                println!("Deactivated keyword {keyword_id}");
            } else {
                println!("Not found: {keyword_id}");
            }
        }
    }
    Ok(())
}

async fn handle_competitor(app: &RankCard, action: CompetitorAction) -> anyhow::Result<()> {
    match action {
        CompetitorAction::Add { name, url } => {
            let id = app.competitor_add(&name, &url).await?;
            println!("Added competitor {id}: {}", name.trim());
        }
        CompetitorAction::List { all } => {
            let competitors = app.competitor_list(all).await?;
            if competitors.is_empty() {
                println!("No competitors configured.");
            }
            for c in competitors {
                let flag = if c.is_active { "" } else { " (inactive)" };
                println!("{:>5}  {} [{}]{flag}", c.id, c.name, c.normalized_domain);
            }
        }
        CompetitorAction::Deactivate { competitor_id } => {
            if app.competitor_deactivate(competitor_id).await? {
                println!("Deactivated competitor {competitor_id}");
            } else {
                println!("Not found: {competitor_id}");
            }
        }
    }
    Ok(())
}

async fn handle_config(app: &RankCard, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match app.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            app.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = app.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}

fn print_report(card: &ReportCard) {
    println!(
        "Report Card ({}): {} ({}/100)",
        card.period, card.grade, card.overall_score
    );
    if card.is_empty() {
        println!("  No active keywords. Use 'keyword add' first.");
        return;
    }
    let m = &card.metrics;
    println!(
        "  Keywords:         {} ranked of {}",
        card.ranked_keywords, card.total_keywords
    );
    println!("  Visibility:       {}", m.visibility);
    println!("  Average position: {}", m.average_position);
    println!("  Position score:   {}", m.position_score);
    println!("  Consistency:      {}", m.consistency);
    println!("  Growth:           {}", m.growth);
    println!("  Competitive:      {}", m.competitive);

    let b = &card.breakdown;
    println!(
        "\nBreakdown: top 3: {}, top 10: {}, top 20: {}, not found: {}",
        b.top3, b.top10, b.top20, b.not_found
    );
    println!(
        "Trends: {} improving, {} declining, {} stable",
        card.trends.improving, card.trends.declining, card.trends.stable
    );

    if !card.top_performers.is_empty() {
        println!("\nTop performers:");
        for k in &card.top_performers {
            println!("  #{:<4} {} ({:?})", k.position, k.keyword, k.trend);
        }
    }
    if !card.needs_attention.is_empty() {
        println!("\nNeeds attention:");
        for k in &card.needs_attention {
            println!("  {:<5} {} ({:?})", position_label(k.position), k.keyword, k.trend);
        }
    }
    if !card.opportunities.is_empty() {
        println!("\nCompetitor gaps:");
        for o in &card.opportunities {
            println!(
                "  {}: {} at #{}, us {} (gap {})",
                o.keyword,
                o.competitor,
                o.competitor_position,
                position_label(o.our_position),
                o.gap
            );
        }
    }
}

fn print_session(session: &InsightSession) {
    println!(
        "Session {} [{}] {} ({})",
        session.id,
        session.analysis_type,
        session.generated_at,
        session.status.as_str()
    );
    println!("\n{}", session.executive_summary);
    for insight in &session.insights {
        println!(
            "\n#{} [{}] {} ({}, {:.0}% confidence, {})",
            insight.id,
            insight.priority.as_str(),
            insight.title,
            insight.category,
            insight.confidence * 100.0,
            insight.status
        );
        println!("  {}", insight.message);
        if !insight.affected_keywords.is_empty() {
            println!("  Keywords: {}", insight.affected_keywords.join(", "));
        }
        for item in &insight.action_items {
            println!("  - {item}");
        }
    }
}

fn position_label(position: u32) -> String {
    if position == 0 {
        "n/f".to_string()
    } else {
        format!("#{position}")
    }
}

fn outcome_label(outcome: KeywordOutcome) -> &'static str {
    match outcome {
        KeywordOutcome::Succeeded => "Succeeded",
        KeywordOutcome::Failed => "Failed",
        KeywordOutcome::CircuitBroken => "Circuit open",
        KeywordOutcome::Skipped => "Skipped",
    }
}
