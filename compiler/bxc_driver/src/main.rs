use anyhow::Result;

fn main() -> Result<()> {
    bxc_driver::main()
}
