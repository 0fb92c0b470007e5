pub fn main() -> ! {
    stepwise_apply_patch::main()
}
