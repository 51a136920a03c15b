use std::env;

use questrade2csv::{extract_transactions, write_ledger, Result, YahooClient};

use anyhow::Error;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 4 {
        return Err(Error::msg(
            "Usage: questrade2csv input.xlsx output.csv accountNumber",
        ));
    }

    let prices = YahooClient::new()?;
    let transactions = extract_transactions(&args[1], &args[3], &prices)?;
    write_ledger(&transactions, &args[2])?;
    println!(
        "Done! Wrote {} transactions to {}",
        transactions.len(),
        args[2]
    );

    Ok(())
}
