//! Hive - 多后端补全调度与 NPC 分层决策
//!
//! 入口：初始化日志、加载配置、用内存世界驱动 NPC，并在终端提供一个行式聊天/管理界面。
//!
//! 用法：`hive [config.toml]`
//! - 普通输入：以 console 玩家身份聊天
//! - `/npc <id> <消息>`：与 Agent 对话
//! - `/persona <key>` `/health` `/reset` `/clear` `/quit`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{run_with_graceful_shutdown, ShutdownManager};
use hive::npc::{run_host_loop, ChannelSink, InMemoryWorld, Position};
use hive::{observability, Hive};
use tokio::io::{AsyncBufReadExt, BufReader};

const CONSOLE_PLAYER: &str = "console";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load configuration")?;

    // 宿主世界：移动 / 外观指令经 channel 回到宿主循环统一应用
    let world = Arc::new(InMemoryWorld::new());
    world.place_observer(CONSOLE_PLAYER, Position::new(0.0, 64.0, 0.0));
    let (sink, rx) = ChannelSink::new(1024);

    let shutdown = Arc::new(ShutdownManager::new());
    let host = tokio::spawn(run_host_loop(Arc::clone(&world), rx, shutdown.token()));

    let hive = Arc::new(Hive::from_config(config, world.clone(), Arc::new(sink)));
    let spawned = hive.start();
    tracing::info!(spawned, "agents spawned");

    let clock_world = Arc::clone(&world);
    let clock_token = shutdown.token();
    tokio::spawn(async move {
        // 20 tick / 秒
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = clock_token.cancelled() => break,
                _ = interval.tick() => clock_world.advance_time(20),
            }
        }
    });

    let coordinator = hive.shutdown_coordinator(Arc::clone(&shutdown));
    let repl_hive = Arc::clone(&hive);
    let report = run_with_graceful_shutdown(
        Arc::clone(&shutdown),
        async move {
            if let Err(e) = repl(&repl_hive).await {
                tracing::error!("console error: {e:#}");
            }
        },
        || async move { coordinator.run_cleanup().await },
    )
    .await;
    if !report.is_clean() {
        tracing::warn!(?report, "shutdown finished with problems");
    }

    let applied = host.await.unwrap_or_default();
    tracing::info!(applied, "host loop finished");
    Ok(())
}

async fn repl(hive: &Hive) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        match parts.next().unwrap_or_default() {
            "/quit" | "/exit" => break,
            "/health" => {
                let snapshot = hive.admin_snapshot().await;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            "/reset" => {
                hive.reset_endpoints();
                println!("endpoints reset");
            }
            "/clear" => {
                let cleared = hive.clear_all_history().await;
                println!("cleared {cleared} conversation(s)");
            }
            "/persona" => match parts.next() {
                Some(key) => match hive.select_persona(CONSOLE_PLAYER, key).await {
                    Ok(_) => println!("persona: {key}"),
                    Err(e) => println!("{e}"),
                },
                None => println!("personas: {}", hive.persona_keys().join(", ")),
            },
            "/npc" => {
                let (Some(id), Some(message)) = (parts.next(), parts.next()) else {
                    println!("usage: /npc <id> <message>");
                    continue;
                };
                match hive.npc() {
                    Some(npc) => match npc.converse(id, CONSOLE_PLAYER, message).await {
                        Ok(reply) => println!("[{id}] {reply}"),
                        Err(e) => println!("{e}"),
                    },
                    None => println!("npc subsystem disabled"),
                }
            }
            _ => match hive.chat(CONSOLE_PLAYER, line).await {
                Ok(reply) => println!("{reply}"),
                Err(e) => println!("{e}"),
            },
        }
    }
    Ok(())
}
