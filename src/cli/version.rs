pub fn execute() {
    println!("tensorage {}", env!("CARGO_PKG_VERSION"));
}
