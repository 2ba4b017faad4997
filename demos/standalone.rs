use tagalloc::Tagalloc;

fn print_alloc(pointer: *mut u8, size: usize, allocator: &Tagalloc) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {pointer:?}");
    println!(
        "Usable bytes behind it: {}",
        unsafe { allocator.usable_size(pointer) }
    );
}

fn main() {
    // RUST_LOG=trace shows the page-level traffic behind each call.
    env_logger::init();

    let allocator = Tagalloc::new();

    unsafe {
        let small = allocator.allocate(1);
        print_alloc(small, 1, &allocator);

        let medium = allocator.allocate(1024);
        print_alloc(medium, 1024, &allocator);

        let large = allocator.allocate(4096);
        print_alloc(large, 4096, &allocator);

        println!("\nLet's try a realloc...");
        *medium = 42;
        let grown = allocator.reallocate(medium, 8192);
        println!("Grown to 8192 bytes at {grown:?}, first byte = {}", *grown);

        println!("\nDeallocating everything...");
        allocator.free(small);
        allocator.free(grown);
        allocator.free(large);

        println!("\nResource usage: {:#?}", allocator.stats());
    }
}
