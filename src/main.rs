// projeto: lstmsensorforecast
// file: src/main.rs
// Linha de comando: treino, previsão, validação de dados e geração de dados sintéticos

use chrono::{DateTime, TimeDelta, Utc};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use ndarray::s;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use lstmsensorforecast::config::{DEFAULT_CONFIG_FILE, Settings};
use lstmsensorforecast::neural::data::{
    default_sensor_profiles, generate_synthetic_table, inspect_table, load_table, parse_timestamp,
    write_csv, DataQualityReport, TimeSeriesTable,
};
use lstmsensorforecast::neural::forecast::{ForecastReport, summarize_trends};
use lstmsensorforecast::neural::model::{EpochControl, SequenceModel};
use lstmsensorforecast::neural::scaler::ScalerParams;
use lstmsensorforecast::neural::storage::{load_artifacts, save_artifacts};
use lstmsensorforecast::neural::utils::ForecastError;
use lstmsensorforecast::neural::window::{build_windows, chronological_split, window_count};

#[derive(Parser, Debug)]
#[command(
    name = "sensor-forecast",
    version = "0.1.0",
    about = "Previsão multivariada de sensores ambientais com LSTM empilhada e atenção",
    long_about = "Treina um modelo LSTM com pooling por atenção sobre séries temporais de sensores, salva o conjunto de artefatos (modelo, scaler, config) e gera previsões alinhadas ao calendário."
)]
struct Cli {
    /// Arquivo de configuração TOML
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Modo verboso de logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Treina um modelo e salva os artefatos
    Train(TrainArgs),
    /// Gera previsões a partir de artefatos salvos
    Predict(PredictArgs),
    /// Verifica a qualidade de um arquivo de dados
    Validate {
        /// Tabela CSV ou JSON com coluna timestamp
        #[arg(long)]
        data: PathBuf,
    },
    /// Gera uma tabela sintética de sensores em CSV
    Generate(GenerateArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Tabela de treino (padrão: dados sintéticos)
    #[arg(long)]
    data: Option<PathBuf>,

    /// Número de épocas
    #[arg(long)]
    epochs: Option<usize>,

    /// Tamanho do lote
    #[arg(long)]
    batch_size: Option<usize>,

    /// Passos de histórico por previsão
    #[arg(long)]
    sequence_length: Option<usize>,

    /// Passos futuros previstos por passagem
    #[arg(long)]
    prediction_horizon: Option<usize>,

    /// Diretório de saída dos artefatos
    #[arg(long)]
    artifacts: Option<PathBuf>,

    /// Semente para inicialização e embaralhamento
    #[arg(long)]
    seed: Option<u64>,

    /// Grava as configurações efetivas no arquivo de configuração
    #[arg(long)]
    save_config: bool,
}

#[derive(Args, Debug)]
struct PredictArgs {
    /// Tabela com o histórico recente
    #[arg(long)]
    data: PathBuf,

    /// Diretório dos artefatos (padrão: paths.artifacts_dir)
    #[arg(long)]
    artifacts: Option<PathBuf>,

    /// Quantos passos prever (padrão: horizonte completo)
    #[arg(long)]
    steps_ahead: Option<usize>,

    /// Não grava os relatórios JSON/CSV
    #[arg(long)]
    no_save: bool,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Arquivo CSV de saída
    #[arg(long, default_value = "sensor_data.csv")]
    output: PathBuf,

    /// Número de linhas
    #[arg(long)]
    samples: Option<usize>,

    /// Semente do gerador
    #[arg(long)]
    seed: Option<u64>,

    /// Intervalo entre leituras, em minutos
    #[arg(long)]
    interval_minutes: Option<i64>,

    /// Primeiro timestamp (padrão: agora menos o período gerado)
    #[arg(long)]
    start: Option<String>,
}

fn main() -> Result<(), ForecastError> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let start_time = Instant::now();
    info!("🚀 Sensor forecast iniciado");
    info!("🕐 Iniciado em: {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));

    let result = Settings::load(&cli.config).and_then(|settings| match cli.command {
        Command::Train(args) => run_train(settings, args, &cli.config),
        Command::Predict(args) => run_predict(&settings, args),
        Command::Validate { data } => run_validate(&data),
        Command::Generate(args) => run_generate(&settings, args),
    });

    match result {
        Ok(()) => {
            info!("✅ Concluído em {:.2}s", start_time.elapsed().as_secs_f64());
            Ok(())
        }
        Err(e) => {
            error!("❌ Erro: {}", e);
            std::process::exit(1);
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_secs()
        .init();
}

fn synthetic_table(settings: &Settings, samples: usize, seed: u64, start: Option<DateTime<Utc>>) -> Result<TimeSeriesTable, ForecastError> {
    let interval = TimeDelta::minutes(settings.data.synthetic_interval_minutes);
    let start = match start {
        Some(start) => start,
        None => {
            let span = i32::try_from(samples)
                .ok()
                .and_then(|n| interval.checked_mul(n))
                .ok_or_else(|| ForecastError::InvalidInput(format!("{} samples is too many", samples)))?;
            Utc::now() - span
        }
    };
    info!("🧪 [Data] Gerando {} linhas sintéticas (semente {})", samples, seed);
    generate_synthetic_table(samples, &default_sensor_profiles(), start, interval, 24, seed)
}

fn log_quality(report: &DataQualityReport) {
    info!("🔍 [Data] {} linhas, canais {:?}", report.rows, report.channels);
    if let (Some(start), Some(end)) = (report.start, report.end) {
        info!("   ├── Período: {} → {}", start, end);
    }
    if let Some(secs) = report.median_interval_secs {
        info!("   ├── Intervalo mediano: {}s", secs);
    }
    if report.is_clean() {
        info!("   └── Nenhum problema encontrado");
    } else {
        for issue in &report.issues {
            warn!("   ⚠️ {}", issue);
        }
    }
}

fn run_train(mut settings: Settings, args: TrainArgs, config_path: &Path) -> Result<(), ForecastError> {
    if let Some(data) = args.data {
        settings.data.path = Some(data);
    }
    if let Some(epochs) = args.epochs {
        settings.training.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        settings.training.batch_size = batch_size;
    }
    if let Some(l) = args.sequence_length {
        settings.model.sequence_length = l;
    }
    if let Some(h) = args.prediction_horizon {
        settings.model.prediction_horizon = h;
    }
    if let Some(dir) = args.artifacts {
        settings.paths.artifacts_dir = dir;
    }
    if args.seed.is_some() {
        settings.training.seed = args.seed;
    }
    settings.validate()?;
    settings.print_summary();
    if args.save_config {
        settings.save(config_path)?;
    }

    let table = match &settings.data.path {
        Some(path) => load_table(path)?,
        None => synthetic_table(&settings, settings.data.synthetic_samples, settings.data.synthetic_seed, None)?,
    };
    log_quality(&inspect_table(&table));

    let (l, h) = (settings.model.sequence_length, settings.model.prediction_horizon);
    let total_windows = window_count(table.len(), l, h);
    if total_windows == 0 {
        return Err(ForecastError::InsufficientData { required: l + h, actual: table.len() });
    }
    let train_windows = (total_windows as f64 * settings.training.train_split).floor() as usize;
    // Scaler sees only rows that feed training windows.
    let train_rows = (train_windows + l + h - 1).min(table.len());
    let scaler = ScalerParams::fit_matrix(
        table.channels().clone(),
        &table.values().slice(s![..train_rows, ..]).to_owned(),
    )?;
    info!("📏 [Scaler] Ajustado em {} de {} linhas", train_rows, table.len());

    let scaled = scaler.transform(table.values())?;
    let windows = build_windows(&scaled, l, h)?;
    let (train, val) = chronological_split(windows, settings.training.train_split)?;

    let config = settings.model_config(table.channels().clone());
    let mut model = match settings.training.seed {
        Some(seed) => SequenceModel::build_seeded(config.clone(), seed)?,
        None => SequenceModel::build(config.clone())?,
    };
    model.print_summary();

    let options = settings.training_options();
    let mut early_stopping = settings.early_stopping();
    let progress = ProgressBar::new(options.epochs as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let log = model.fit(&train, &val, &options, |metrics| {
        progress.set_position(metrics.epoch as u64);
        progress.set_message(format!(
            "loss {:.5} val {:.5}{}",
            metrics.train_loss,
            metrics.val_loss,
            if metrics.improved { " *" } else { "" }
        ));
        if early_stopping.should_stop(metrics.val_loss, metrics.epoch) {
            progress.println(format!(
                "⏹️ Early stopping na época {} (melhor val_loss {:.6})",
                metrics.epoch,
                early_stopping.best_score().unwrap_or(f64::NAN)
            ));
            EpochControl::Stop
        } else {
            EpochControl::Continue
        }
    });
    progress.finish_and_clear();
    let log = log?;
    log.print_summary();

    let evaluation = model.evaluate(&val)?;
    evaluation.print("Validation", config.channel_names.names());

    save_artifacts(&model, Some(&scaler), &config, &settings.paths.artifacts_dir)?;

    fs::create_dir_all(&settings.paths.reports_dir)?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    log.save_to_csv(&settings.paths.reports_dir.join(format!("training_history_{}.csv", stamp)))?;
    let metrics_path = settings.paths.reports_dir.join(format!("evaluation_{}.json", stamp));
    fs::write(&metrics_path, serde_json::to_string_pretty(&evaluation)?)?;
    info!("📊 Métricas de validação salvas em: {}", metrics_path.display());
    Ok(())
}

fn run_predict(settings: &Settings, args: PredictArgs) -> Result<(), ForecastError> {
    let artifacts = args.artifacts.unwrap_or_else(|| settings.paths.artifacts_dir.clone());
    let forecaster = load_artifacts(&artifacts)?;
    let recent = load_table(&args.data)?;

    let forecast = forecaster.forecast(&recent, args.steps_ahead)?;
    info!("🔮 [Forecast] {} passos previstos:", forecast.len());
    let names = forecast.channels().names();
    info!("   {:<20} {}", "timestamp", names.iter().map(|n| format!("{:>12}", n)).collect::<String>());
    for (ts, row) in forecast.timestamps().iter().zip(forecast.values().rows()) {
        info!(
            "   {:<20} {}",
            ts.format("%Y-%m-%d %H:%M:%S"),
            row.iter().map(|v| format!("{:>12.3}", v)).collect::<String>()
        );
    }

    info!("📈 [Forecast] Tendências:");
    for trend in summarize_trends(&recent, &forecast)? {
        let change = trend
            .change_pct
            .map(|c| format!("{:+.2}%", c))
            .unwrap_or_else(|| "n/a".to_string());
        info!(
            "   {:<20}: {:>10.2} → {:>10.2} {} ({})",
            trend.channel,
            trend.last_observed,
            trend.last_predicted,
            trend.direction.arrow(),
            change
        );
    }

    if !args.no_save {
        fs::create_dir_all(&settings.paths.reports_dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let csv_path = settings.paths.reports_dir.join(format!("sensor_predictions_{}.csv", stamp));
        write_csv(&forecast.to_table()?, &csv_path)?;
        info!("💾 Previsões salvas em: {}", csv_path.display());

        let report = ForecastReport::new(forecaster.config(), &recent, &forecast)?;
        report.save_json(&settings.paths.reports_dir.join(format!("sensor_predictions_{}.json", stamp)))?;
    }
    Ok(())
}

fn run_validate(data: &Path) -> Result<(), ForecastError> {
    let table = match load_table(data) {
        Ok(table) => table,
        Err(ForecastError::InvalidInput(msg)) => {
            error!("❌ [Data] {} não pode ser usado: {}", data.display(), msg);
            return Err(ForecastError::InvalidInput(msg));
        }
        Err(e) => return Err(e),
    };
    let report = inspect_table(&table);
    log_quality(&report);
    info!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_generate(settings: &Settings, args: GenerateArgs) -> Result<(), ForecastError> {
    let mut settings = settings.clone();
    if let Some(minutes) = args.interval_minutes {
        settings.data.synthetic_interval_minutes = minutes;
    }
    if settings.data.synthetic_interval_minutes <= 0 {
        return Err(ForecastError::InvalidConfig("interval must be positive".to_string()));
    }
    let start = args.start.as_deref().map(parse_timestamp).transpose()?;
    let samples = args.samples.unwrap_or(settings.data.synthetic_samples);
    let seed = args.seed.unwrap_or(settings.data.synthetic_seed);

    let table = synthetic_table(&settings, samples, seed, start)?;
    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    write_csv(&table, &args.output)?;
    info!("💾 {} linhas × {} canais salvas em {}", table.len(), table.channels().len(), args.output.display());
    Ok(())
}
