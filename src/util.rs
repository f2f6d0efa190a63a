macro_rules! time {
    ($f:block) => {{
        let start = std::time::Instant::now();
        let result = $f;
        let duration = start.elapsed();
        (result, duration)
    }};
}

macro_rules! time_info {
    ($name:expr, $f:block) => {{
        let start = std::time::Instant::now();
        let result = $f;
        log::info!("{} (took {:?})", $name, start.elapsed());
        result
    }};
}

macro_rules! time_debug {
    ($name:expr, $f:block) => {{
        let start = std::time::Instant::now();
        let result = $f;
        log::debug!("{} (took {:?})", $name, start.elapsed());
        result
    }};
}
