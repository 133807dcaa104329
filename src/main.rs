fn main() {
    fieldsync::run()
}
