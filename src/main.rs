fn main() {
    genpack_helper::entry::main();
}
