//! Acceptance tests for publish, broadcast and catch-up using Cucumber.
//!
//! Two chat services share one SQLite file and one broadcast channel, the same
//! shape as two worker processes behind one port.
//!
//! ```bash
//! cargo test --test acceptance --features sqlite,test-utils
//! ```

mod steps;

use cucumber::World;
use steps::chat::ChatWorld;

#[tokio::main]
async fn main() {
    println!("\n=== Running Chat Acceptance Tests ===\n");
    ChatWorld::cucumber()
        .fail_on_skipped()
        .run("tests/acceptance/features/chat.feature")
        .await;
}
