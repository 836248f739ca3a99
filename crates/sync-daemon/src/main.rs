//! 계좌 동기화 데몬 CLI.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{init_logging, LogConfig, LogFormat};
use sync_daemon::FileAccountsProvider;
use sync_data::{MemorySyncStore, PgSyncStore, SyncStore};
use sync_exchange::sim::{SimGateway, SimRestClient};
use sync_exchange::{Gateway, RestClient};
use sync_engine::{EngineConfig, SyncEngine};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "sync-daemon")]
#[command(about = "ZeroSync Account Synchronization Daemon", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 로그 레벨 (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// 동기화 엔진 실행
    Run {
        /// 시뮬레이션 게이트웨이로 실행 (실거래소 연결 없이 합성 이벤트)
        #[arg(long)]
        simulate: bool,
    },

    /// 상태 요약 파일 출력
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // 로깅 초기화
    let format = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LogFormat::Pretty);
    init_logging(LogConfig::new(cli.log_level.as_str()).with_format(format))
        .map_err(|e| anyhow::anyhow!("로깅 초기화 실패: {}", e))?;

    match cli.command {
        Commands::Run { simulate } => run(simulate).await,
        Commands::Status => show_status(),
    }
}

async fn run(simulate: bool) -> anyhow::Result<()> {
    tracing::info!("ZeroSync 데몬 시작");

    let config = EngineConfig::from_env();
    let accounts = FileAccountsProvider::from_env();

    let (gateway, rest): (Arc<dyn Gateway>, Arc<dyn RestClient>) = if simulate {
        tracing::warn!("시뮬레이션 게이트웨이로 실행 중 (합성 이벤트)");
        let gateway = SimGateway::with_auto_events(Duration::from_secs(2));
        (gateway, SimRestClient::new())
    } else {
        // 실거래소 커넥터는 Gateway trait 구현으로 배포 빌드에서 연결됨
        anyhow::bail!(
            "실거래소 게이트웨이 커넥터가 구성되지 않았습니다. --simulate로 실행하세요"
        );
    };

    // 저장소: DATABASE_URL이 있으면 PostgreSQL, 없으면 인메모리
    let store: Arc<dyn SyncStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = sqlx::PgPool::connect(&url).await?;
            tracing::info!("데이터베이스 연결 성공");
            Arc::new(PgSyncStore::new(pool, rest))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL 미설정, 인메모리 저장소 사용");
            Arc::new(MemorySyncStore::new())
        }
    };

    let engine = SyncEngine::new(gateway, store, accounts, config);

    // 종료 신호 처리
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("종료 신호 수신, 데몬 종료 중...");
            signal_token.cancel();
        }
    });

    engine.run(shutdown).await;

    tracing::info!("ZeroSync 데몬 종료");
    Ok(())
}

fn show_status() -> anyhow::Result<()> {
    let path =
        std::env::var("SYNC_STATUS_FILE").unwrap_or_else(|_| "sync-status.json".to_string());
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("{} 읽기 실패: {} (데몬이 실행 중인가요?)", path, e))?;
    println!("{}", raw);
    Ok(())
}
