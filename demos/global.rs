use tagalloc::Tagalloc;

// NOTE: This example doesn't work under Miri because the system page source
// degrades to `std::alloc` there (no FFI calls allowed). If we are the global
// allocator, requesting pages through `std::alloc::alloc` comes right back to
// us while we already hold the arena lock, which deadlocks. It turns out that
// we cannot simulate ourselves within ourselves.

#[global_allocator]
static ALLOCATOR: Tagalloc = Tagalloc::new();

fn main() {
    let num = Box::new(10);
    println!("Boxed num {num} at {:?}", &*num as *const usize);

    let mut vec = Vec::with_capacity(*num);

    for i in 0..*num {
        vec.push(i);
    }

    println!("Vec: {vec:?} at {:?}", vec.as_ptr());

    let handle = std::thread::spawn(|| {
        let mut vec: Vec<u8> = Vec::with_capacity(256);
        vec.push(5);
        vec.push(6);
        println!("Second thread Vec: {vec:?} at {:?}", vec.as_ptr());
    });

    handle.join().unwrap();

    // Past the mapping threshold this one comes from its own pages.
    let cap = 1024 * 1024;
    let mut vec: Vec<u8> = Vec::with_capacity(cap);
    vec.push(1);

    println!("Large allocation of {cap} bytes at {:?}", vec.as_ptr());
    println!("Resource usage: {:#?}", ALLOCATOR.stats());
}
