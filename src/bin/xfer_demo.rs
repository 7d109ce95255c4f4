// ABOUTME: Demo binary — walks a single XFER transfer end to end against the null FDO compiler
// ABOUTME: Prints the chunks a real connection's pacer would receive; sends nothing over a socket

use dialtone::fdo::NullFdoCompiler;
use dialtone::xfer::Transfer;

fn main() {
    let compiler = NullFdoCompiler;
    let payload = b"the quick brown fox jumps over the lazy dog\n".repeat(20);

    let (mut transfer, prelude) = Transfer::initiate(1, "demo.txt", payload, &compiler, 128)
        .expect("null compiler never fails to compile");

    println!("prelude ({} chunks):", prelude.len());
    for chunk in &prelude {
        println!("  {} ({} bytes)", chunk.token, chunk.payload.len());
    }

    transfer.on_client_ready().expect("transfer was awaiting go");

    let mut total_blocks = 0;
    loop {
        let chunks = transfer.next_chunks().expect("transfer is streaming");
        if chunks.is_empty() {
            break;
        }
        total_blocks += chunks.len();
        for chunk in &chunks {
            println!("  {} ({} bytes)", chunk.token, chunk.payload.len());
        }
        if transfer.state() == dialtone::xfer::TransferState::Done {
            break;
        }
    }

    println!("transfer {} finished: {} chunks in the data phase", transfer.id(), total_blocks);
}
