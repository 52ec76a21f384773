use std::io::Write as _;

use turnstream::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), StreamError> {
    turnstream::init_observability();

    let client = ChatClient::from_env()?;
    let (handle, signal) = abort_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.abort();
        }
    });

    let request = ChatRequest::new(vec![
        ChatMessage::system("Answer briefly."),
        ChatMessage::user("Say hello"),
    ]);
    let mut printed = 0;
    let turn = client
        .send(&request, signal, |snapshot| {
            if let Some(text) = snapshot.messages.last() {
                print!("{}", &text.content[printed.min(text.content.len())..]);
                let _ = std::io::stdout().flush();
                printed = text.content.len();
            }
        })
        .await?;

    println!();
    if turn.cancelled {
        println!("(cancelled)");
    }
    println!("data items: {}", turn.data.len());
    Ok(())
}
