//! Interactive terminal loop: type a question, read the answer.

use nl_sql_agent::{agent::Agent, config::Config};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nl_sql_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    let agent = Agent::from_config(&config).await?;

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(b"\nNL-to-SQL agent ready. Ask a question about the sales database ('exit' to quit).\n")
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"\nYou: ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question.eq_ignore_ascii_case("exit") || question.eq_ignore_ascii_case("quit") {
            break;
        }

        let answer = agent.answer(question).await;
        stdout
            .write_all(format!("Agent: {}\n", answer).as_bytes())
            .await?;
    }

    stdout.write_all(b"Exiting agent.\n").await?;
    Ok(())
}
