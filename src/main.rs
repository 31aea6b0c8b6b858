fn main() {
    if let Err(e) = QuiverCGI::cli::run() {
        // Логгер может быть ещё не поднят: печатаем напрямую.
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
