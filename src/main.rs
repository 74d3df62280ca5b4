//! Interactive CLI driver for the VICW memory engine.
//!
//! Wires the runtime against live backends (Redis, Qdrant, Neo4j, an
//! OpenAI-compatible LLM, an embedding endpoint) and runs a conversation
//! loop. The cold path is paused during generation and resumed after.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vicw_runtime::config::{apply_thread_caps, MemoryConfig};
use vicw_runtime::context::ContextManager;
use vicw_runtime::embedding::{EmbeddingService, HttpEmbeddingService};
use vicw_runtime::extractor::Extractor;
use vicw_runtime::guard::EchoGuard;
use vicw_runtime::inference::{InferenceOptions, InferenceProvider, OpenAiCompatProvider};
use vicw_runtime::queue::OffloadQueue;
use vicw_runtime::retriever::Retriever;
use vicw_runtime::stores::graph_neo4j::Neo4jGraphStore;
use vicw_runtime::stores::kv_redis::RedisKvStore;
use vicw_runtime::stores::vector_qdrant::QdrantVectorIndex;
use vicw_runtime::stores::{GraphStore, KvStore, VectorIndex};
use vicw_runtime::types::Role;
use vicw_runtime::worker::{ColdPathWorker, IngestionPipeline, SleepCycle};

#[derive(Parser, Debug)]
#[command(name = "vicw", about = "Virtual infinite context window chat session")]
struct Args {
    /// System prompt file loaded into the context at startup.
    #[arg(long, default_value = "system_prompt.txt")]
    system_prompt: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vicw=info".parse()?))
        .init();

    let args = Args::parse();
    let config = MemoryConfig::from_env().context("configuration failed")?;
    apply_thread_caps(config.cold_path.workers);

    info!("initializing stores");
    let kv: Arc<dyn KvStore> = Arc::new(
        RedisKvStore::connect(&config.stores.redis_url, config.stores.chunk_ttl_secs)
            .await
            .context("redis init failed")?,
    );
    let vectors: Arc<dyn VectorIndex> = Arc::new(
        QdrantVectorIndex::connect(
            &config.stores.qdrant_url,
            &config.stores.qdrant_collection,
            config.embedding.dimension,
        )
        .context("qdrant init failed")?,
    );
    vectors.ensure_collection().await.context("qdrant collection init failed")?;
    let graph: Arc<dyn GraphStore> = Arc::new(
        Neo4jGraphStore::connect(
            &config.stores.neo4j_uri,
            &config.stores.neo4j_user,
            &config.stores.neo4j_password,
        )
        .await
        .context("neo4j init failed")?,
    );
    graph.ensure_schema().await.context("neo4j schema init failed")?;

    let llm: Arc<dyn InferenceProvider> =
        Arc::new(OpenAiCompatProvider::new(&config.llm).context("LLM init failed")?);
    let embedder: Arc<dyn EmbeddingService> = Arc::new(
        HttpEmbeddingService::new(&config.embedding).context("embedding init failed")?,
    );

    let extractor = Arc::new(Extractor::new(llm.clone(), config.llm.max_tokens));
    let queue = Arc::new(OffloadQueue::new(config.cold_path.max_queue_size));
    let retriever = Arc::new(Retriever::new(
        extractor.clone(),
        embedder.clone(),
        vectors.clone(),
        graph.clone(),
        config.rag.clone(),
    ));
    let pipeline = Arc::new(IngestionPipeline::new(
        extractor.clone(),
        embedder.clone(),
        kv.clone(),
        vectors.clone(),
        graph.clone(),
    ));
    let sleep_cycle = Arc::new(SleepCycle::new(
        extractor.clone(),
        embedder.clone(),
        vectors.clone(),
        graph.clone(),
        config.cold_path.clone(),
    ));
    let worker = ColdPathWorker::new(queue.clone(), pipeline, sleep_cycle, config.cold_path.clone());
    worker.start();

    let guard = EchoGuard::new(llm.clone(), embedder.clone(), kv.clone(), config.echo.clone());
    let mut manager = ContextManager::new(config.context.clone(), config.state.clone(), queue.clone())
        .with_retriever(retriever)
        .with_graph(graph.clone());

    match tokio::fs::read_to_string(&args.system_prompt).await {
        Ok(prompt) => {
            manager.append(Role::System, prompt.trim());
            info!(path = %args.system_prompt.display(), "system prompt loaded");
        }
        Err(_) => info!(path = %args.system_prompt.display(), "no system prompt file"),
    }

    println!("VICW session ready. Type 'exit' to quit, 'stats' for statistics, 'reset' to clear context.");

    let options = InferenceOptions {
        max_tokens: config.llm.max_tokens,
        temperature: config.llm.temperature,
        json_object: false,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut turn = 0u64;

    loop {
        stdout.write_all(b"\nYou: ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();

        match input {
            "" => continue,
            "exit" => break,
            "stats" => {
                let context = manager.stats();
                let queue_stats = queue.stats();
                let worker_stats = worker.stats();
                println!(
                    "Context: {}/{} tokens ({:.1}%), {} messages, {} offloads",
                    context.current_tokens,
                    context.max_tokens,
                    context.pressure_percentage,
                    context.message_count,
                    context.offload_count,
                );
                println!(
                    "Queue: {}/{} (enqueued {}, processed {}, dropped {})",
                    queue_stats.current_size,
                    queue_stats.max_size,
                    queue_stats.enqueued_total,
                    queue_stats.processed_total,
                    queue_stats.dropped_total,
                );
                println!(
                    "Worker: processed {}, failed {}",
                    worker_stats.processed, worker_stats.failed,
                );
                match kv.recent_chunks(3).await {
                    Ok(recent) if !recent.is_empty() => {
                        println!("Recent archives:");
                        for chunk in recent {
                            let preview: String = chunk
                                .summary
                                .lines()
                                .next()
                                .unwrap_or("")
                                .chars()
                                .take(60)
                                .collect();
                            println!(
                                "  {} ({} tokens, {} msgs): {preview}",
                                chunk.job_id, chunk.token_count, chunk.message_count,
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "recent chunk lookup failed"),
                }
                continue;
            }
            "reset" => {
                manager.reset();
                println!("Context cleared.");
                continue;
            }
            _ => {}
        }

        turn += 1;
        manager.append(Role::User, input);

        let injected = manager.augment(input).await;
        if injected > 0 {
            println!("[Retrieved {injected} items from long-term memory]");
        }

        // Keep ingestion off the CPU while the model generates.
        worker.pause();
        let response = guard.generate(&manager.window(), &options).await;
        worker.resume();

        match response {
            Ok(guarded) => {
                println!("\nAssistant: {}", guarded.content);
                manager.append(Role::Assistant, guarded.content);
            }
            Err(e) => {
                error!(turn, error = %e, "generation failed");
                println!("ERROR: {e}");
            }
        }
    }

    println!("\nShutting down...");
    worker.stop().await;

    // External connections close in reverse of init order.
    graph.close().await;
    vectors.shutdown().await;
    kv.shutdown().await;
    llm.shutdown().await;

    info!(turns = turn, "session ended");
    Ok(())
}
