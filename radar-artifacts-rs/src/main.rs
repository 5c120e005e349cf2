fn main() {
    radar_artifacts::cli::run();
}
