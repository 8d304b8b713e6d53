use std::{io::Write, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use wms_relay_core::{
    config::AppConfig,
    llm::HttpGateway,
    models::RelayEvent,
    relay::RelayRequest,
    server::{self, AppState},
    store::ConversationStore,
    telemetry,
};

/**
 * \brief CLI 程序入口：启动中继服务或在本地跑一轮对话。
 */
#[derive(Parser, Debug)]
#[command(name = "wms-relay", version, about = "WMS streaming chat relay")]
struct Cli {
    /** \brief 输出 JSON 结构化日志。 */
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 服务。
     * \param addr 监听地址，缺省取配置
     */
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },

    /**
     * \brief 发送一条消息并流式显示模型回复。
     */
    Chat {
        #[arg(long)]
        message: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        chat_id: Option<i64>,
        #[arg(long, default_value_t = false)]
        use_history: bool,
    },

    /**
     * \brief 新建匿名会话并打印其 ID。
     */
    NewChat {
        #[arg(long)]
        model: Option<String>,
    },

    /**
     * \brief 列出模型表。
     */
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init(cli.json_logs);

    let mut config = AppConfig::load().context("load config failed")?;

    match cli.command {
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                config.addr = addr;
            }
            let state = build_state(config)?;
            server::run(state).await?;
        }
        Commands::Chat {
            message,
            model,
            chat_id,
            use_history,
        } => {
            let state = build_state(config)?;
            let req = RelayRequest {
                message,
                model,
                chat_id,
                use_history,
            };
            let mut rx = state
                .relay
                .stream(req, None)
                .await
                .context("open relay stream failed")?;

            let mut in_reasoning = false;
            while let Some(event) = rx.recv().await {
                match event {
                    RelayEvent::Reasoning(text) => {
                        if !in_reasoning {
                            eprint!("\x1b[2m[reasoning] ");
                            in_reasoning = true;
                        }
                        eprint!("{}", text);
                    }
                    RelayEvent::Content(text) => {
                        if in_reasoning {
                            eprintln!("\x1b[0m");
                            in_reasoning = false;
                        }
                        print!("{}", text);
                        std::io::stdout().flush().ok();
                    }
                    RelayEvent::Error(err) => {
                        if in_reasoning {
                            eprintln!("\x1b[0m");
                        }
                        anyhow::bail!("stream error: {}", err);
                    }
                    RelayEvent::Done => break,
                }
            }
            if in_reasoning {
                eprintln!("\x1b[0m");
            }
            println!();
        }
        Commands::NewChat { model } => {
            let store = ConversationStore::open(&config.db_path).context("open database failed")?;
            let model = config.resolve_model(model.as_deref());
            let chat = store
                .create_chat(None, &model.id)
                .await
                .context("create chat failed")?;
            info!(chat_id = chat.id, model = %chat.model_id, "chat created");
            println!("Created chat id={} (model={})", chat.id, chat.model_id);
        }
        Commands::Models => {
            for model in &config.models {
                let marker = if model.id == config.default_model { "*" } else { " " };
                println!(
                    "{} {} | {} | reasoning={} | {}",
                    marker, model.id, model.name, model.has_reasoning, model.base_url
                );
            }
        }
    }

    Ok(())
}

fn build_state(config: AppConfig) -> Result<AppState> {
    let store = ConversationStore::open(&config.db_path).context("open database failed")?;
    let gateway = Arc::new(HttpGateway::new(config.api_key.clone()));
    Ok(AppState::new(config, store, gateway))
}
